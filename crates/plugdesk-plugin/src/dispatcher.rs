// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-to-guest call dispatch for a single loaded plugin.
//!
//! Each [`LoadedPlugin`] wraps one guest instance behind an async mutex, so
//! calls into the same plugin are serialized while different plugins run
//! concurrently. Callers pass a [`CancellationToken`]; cancellation while
//! waiting for the instance or for the guest yields
//! [`PlugdeskError::Cancelled`] and discards any late result.

use std::sync::Arc;
use std::time::Duration;

use plugdesk_core::{GuestInstance, PlugdeskError, RuntimeKind};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manifest::{parse_guest_manifest, PluginManifest};

/// Arguments sent when the caller provides none.
const EMPTY_ARGS: &[u8] = b"{}";

/// A guest instance together with the manifest it registered.
pub struct LoadedPlugin {
    manifest: Arc<PluginManifest>,
    runtime: RuntimeKind,
    guest: Mutex<Box<dyn GuestInstance>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl LoadedPlugin {
    /// Run the registration export and wrap the guest.
    ///
    /// The manifest must validate and must carry `expected_name`; on any
    /// failure the guest is shut down before the error is returned.
    pub async fn bootstrap(
        expected_name: &str,
        mut guest: Box<dyn GuestInstance>,
        deadline: Duration,
    ) -> Result<Self, PlugdeskError> {
        let registered = match tokio::time::timeout(deadline, guest.register()).await {
            Ok(result) => result,
            Err(_) => Err(PlugdeskError::Timeout { duration: deadline }),
        };

        let manifest = registered.and_then(|bytes| {
            let manifest = parse_guest_manifest(&bytes)?;
            if manifest.name != expected_name {
                return Err(PlugdeskError::Validation(format!(
                    "manifest name `{}` does not match package name `{expected_name}`",
                    manifest.name
                )));
            }
            Ok(manifest)
        });

        match manifest {
            Ok(manifest) => {
                debug!(
                    plugin = %manifest.name,
                    version = %manifest.version,
                    routes = manifest.routes.len(),
                    widgets = manifest.widgets.len(),
                    "guest registered"
                );
                Ok(Self {
                    runtime: guest.runtime(),
                    manifest: Arc::new(manifest),
                    guest: Mutex::new(guest),
                })
            }
            Err(e) => {
                if let Err(shutdown_err) = guest.shutdown().await {
                    warn!(plugin = %expected_name, error = %shutdown_err, "guest shutdown after failed registration");
                }
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &Arc<PluginManifest> {
        &self.manifest
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    /// Invoke `function` with JSON `args` and return the guest's bytes unmodified.
    ///
    /// Empty `args` are replaced with `{}`. The deadline covers both waiting
    /// for the instance lock and the guest call itself.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        function: &str,
        args: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, PlugdeskError> {
        let args = if args.is_empty() { EMPTY_ARGS } else { args };

        let call = async {
            let mut guest = self.guest.lock().await;
            guest.call(function, args).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(plugin = %self.manifest.name, function, "call cancelled by caller");
                Err(PlugdeskError::Cancelled)
            }
            outcome = tokio::time::timeout(deadline, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(PlugdeskError::Timeout { duration: deadline }),
            },
        }
    }

    /// Call the guest's shutdown hook, waiting for any in-flight call first.
    pub async fn shutdown(&self) -> Result<(), PlugdeskError> {
        self.guest.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugdesk_test_utils::MockGuest;

    fn manifest_json(name: &str) -> String {
        format!(r#"{{"name":"{name}","version":"1.0.0"}}"#)
    }

    async fn loaded(guest: MockGuest) -> LoadedPlugin {
        LoadedPlugin::bootstrap("echo", Box::new(guest), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_rejects_name_mismatch() {
        let guest = MockGuest::new(manifest_json("other"));
        let shutdowns = guest.shutdown_counter();
        let err = LoadedPlugin::bootstrap("echo", Box::new(guest), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
        assert_eq!(shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_args_become_empty_object() {
        let guest = MockGuest::new(manifest_json("echo")).with_echo("echo");
        let plugin = loaded(guest).await;
        let out = plugin
            .invoke(&CancellationToken::new(), "echo", b"", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, b"{}");
    }

    #[tokio::test]
    async fn guest_bytes_pass_through_unmodified() {
        let guest = MockGuest::new(manifest_json("echo")).with_echo("echo");
        let plugin = loaded(guest).await;
        let out = plugin
            .invoke(
                &CancellationToken::new(),
                "echo",
                br#"{"a": [1, 2]}"#,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out, br#"{"a": [1, 2]}"#);
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled() {
        let guest = MockGuest::new(manifest_json("echo"))
            .with_echo("slow")
            .with_delay("slow", Duration::from_secs(30));
        let plugin = loaded(guest).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = plugin
            .invoke(&cancel, "slow", b"{}", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PlugdeskError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let guest = MockGuest::new(manifest_json("echo"))
            .with_echo("slow")
            .with_delay("slow", Duration::from_secs(30));
        let plugin = loaded(guest).await;
        let err = plugin
            .invoke(&CancellationToken::new(), "slow", b"{}", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PlugdeskError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unknown_function_is_a_runtime_error() {
        let plugin = loaded(MockGuest::new(manifest_json("echo"))).await;
        let err = plugin
            .invoke(&CancellationToken::new(), "nope", b"{}", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_guest_failure());
    }
}
