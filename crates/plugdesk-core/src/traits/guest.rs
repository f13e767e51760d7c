// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guest runtime traits.
//!
//! The host never needs compile-time knowledge of guest types. Every guest,
//! whatever runs it, is reduced to "call this named export with these bytes
//! and give me bytes back".

use async_trait::async_trait;

use crate::error::PlugdeskError;
use crate::types::{PluginSource, RuntimeKind};

/// A live, initialized guest.
///
/// Instances are not assumed to be safe for concurrent use; the registry
/// serializes calls to a single instance.
#[async_trait]
pub trait GuestInstance: Send + 'static {
    /// The runtime this instance executes in.
    fn runtime(&self) -> RuntimeKind;

    /// Invokes the registration export and returns the manifest JSON.
    async fn register(&mut self) -> Result<Vec<u8>, PlugdeskError>;

    /// Invokes a named export with JSON-encoded arguments.
    ///
    /// Guest-side failures are reported as [`PlugdeskError::Runtime`].
    async fn call(&mut self, function: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError>;

    /// Releases guest resources. Called once before the instance is dropped.
    async fn shutdown(&mut self) -> Result<(), PlugdeskError>;
}

/// Creates guest instances from packages on disk.
#[async_trait]
pub trait GuestLoader: Send + Sync + 'static {
    /// Instantiates the module described by `source`.
    async fn load(&self, source: &PluginSource) -> Result<Box<dyn GuestInstance>, PlugdeskError>;
}
