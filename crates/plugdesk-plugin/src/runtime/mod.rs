// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guest runtimes.
//!
//! [`RuntimeLoader`] picks the runtime named by a [`PluginSource`]: the
//! embedded WebAssembly sandbox or a child process speaking JSON lines.

mod process;
mod wasm;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use plugdesk_core::{GuestInstance, GuestLoader, LogLevel, PlugdeskError, PluginSource, RuntimeKind};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use process::{ProcessGuest, ProcessRuntime};
pub use wasm::{WasmGuest, WasmRuntime, WasmSettings};

use crate::registry::PluginManager;

/// Services the host exposes to running guests.
///
/// Called from blocking threads while a guest call is in progress.
pub trait HostApi: Send + Sync + 'static {
    /// Record a log line on behalf of `plugin`.
    fn log(&self, plugin: &str, level: LogLevel, message: &str);

    /// Handle a named host call and return JSON bytes for the guest.
    fn host_call(&self, plugin: &str, function: &str, args: &[u8]) -> Vec<u8>;
}

/// Arguments of the `plugin.call` host function.
#[derive(Debug, Deserialize)]
struct PluginCallArgs {
    plugin: String,
    function: String,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

/// [`HostApi`] backed by the plugin registry.
///
/// Holds a weak reference so the registry can be dropped while guests that
/// captured this bridge are still alive.
pub struct ManagerHostApi {
    manager: Weak<PluginManager>,
}

impl ManagerHostApi {
    pub fn new(manager: &Arc<PluginManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }

    fn plugin_call(&self, caller: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| PlugdeskError::Internal("plugin registry is shut down".into()))?;
        let request: PluginCallArgs = serde_json::from_slice(args)
            .map_err(|e| PlugdeskError::Validation(format!("plugin.call arguments: {e}")))?;
        let args = match &request.args {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| PlugdeskError::Internal(e.to_string()))?,
            None => Vec::new(),
        };
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PlugdeskError::Internal(format!("no async runtime: {e}")))?;
        handle.block_on(manager.call_from(
            caller,
            &CancellationToken::new(),
            &request.plugin,
            &request.function,
            &args,
        ))
    }
}

impl HostApi for ManagerHostApi {
    fn log(&self, plugin: &str, level: LogLevel, message: &str) {
        match self.manager.upgrade() {
            Some(manager) => manager.logs().log(plugin, level, message, None),
            None => tracing::debug!(plugin, %level, "{message}"),
        }
    }

    fn host_call(&self, plugin: &str, function: &str, args: &[u8]) -> Vec<u8> {
        let result = match function {
            "plugin.call" => self.plugin_call(plugin, args),
            other => Err(PlugdeskError::NotFound {
                kind: "host function".to_string(),
                name: other.to_string(),
            }),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(plugin, function, error = %e, "host call failed");
            serde_json::json!({ "error": e.to_string() })
                .to_string()
                .into_bytes()
        })
    }
}

/// Loads guests with the runtime their package asks for.
pub struct RuntimeLoader {
    wasm: Arc<WasmRuntime>,
    process: ProcessRuntime,
}

impl RuntimeLoader {
    pub fn new(wasm: Arc<WasmRuntime>, process: ProcessRuntime) -> Self {
        Self { wasm, process }
    }

    pub fn wasm(&self) -> &Arc<WasmRuntime> {
        &self.wasm
    }
}

#[async_trait]
impl GuestLoader for RuntimeLoader {
    async fn load(&self, source: &PluginSource) -> Result<Box<dyn GuestInstance>, PlugdeskError> {
        match source.runtime {
            RuntimeKind::Wasm => Ok(Box::new(self.wasm.instantiate(source).await?)),
            RuntimeKind::Process => Ok(Box::new(self.process.spawn(source).await?)),
        }
    }
}
