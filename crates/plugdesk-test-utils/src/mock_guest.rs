// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted guest instance for deterministic testing.
//!
//! `MockGuest` implements `GuestInstance` with a fixed manifest and
//! per-function replies. Clones share their counters, so a test can keep one
//! copy for assertions while the registry owns another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plugdesk_core::{GuestInstance, PlugdeskError, RuntimeKind};

#[derive(Clone)]
enum Reply {
    Echo,
    Fixed(Vec<u8>),
}

#[derive(Default)]
struct Stats {
    calls: Mutex<HashMap<String, usize>>,
    shutdowns: Arc<AtomicUsize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Tracks a call in progress; released on drop so cancelled calls count too.
struct InFlight<'a>(&'a Stats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a Stats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A mock guest returning pre-configured replies.
///
/// Functions without a reply fail with [`PlugdeskError::Runtime`], the way a
/// real guest reports an unknown export.
#[derive(Clone)]
pub struct MockGuest {
    name: String,
    manifest: Vec<u8>,
    replies: HashMap<String, Reply>,
    delays: HashMap<String, Duration>,
    stats: Arc<Stats>,
}

impl MockGuest {
    /// Create a guest whose registration returns `manifest_json` verbatim.
    pub fn new(manifest_json: impl Into<String>) -> Self {
        let manifest: String = manifest_json.into();
        let name = serde_json::from_str::<serde_json::Value>(&manifest)
            .ok()
            .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
            .unwrap_or_else(|| "mock".to_string());
        Self {
            name,
            manifest: manifest.into_bytes(),
            replies: HashMap::new(),
            delays: HashMap::new(),
            stats: Arc::default(),
        }
    }

    /// Answer `function` with its own arguments.
    pub fn with_echo(mut self, function: &str) -> Self {
        self.replies.insert(function.to_string(), Reply::Echo);
        self
    }

    /// Answer `function` with fixed bytes.
    pub fn with_response(mut self, function: &str, body: impl Into<Vec<u8>>) -> Self {
        self.replies
            .insert(function.to_string(), Reply::Fixed(body.into()));
        self
    }

    /// Sleep before answering `function`.
    pub fn with_delay(mut self, function: &str, delay: Duration) -> Self {
        self.delays.insert(function.to_string(), delay);
        self
    }

    /// Counter incremented by every `shutdown` call.
    pub fn shutdown_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stats.shutdowns)
    }

    /// How often `function` was called, across all clones.
    pub fn call_count(&self, function: &str) -> usize {
        self.lock_calls().get(function).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.stats.calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for MockGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGuest").field("name", &self.name).finish()
    }
}

#[async_trait]
impl GuestInstance for MockGuest {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    async fn register(&mut self) -> Result<Vec<u8>, PlugdeskError> {
        Ok(self.manifest.clone())
    }

    async fn call(&mut self, function: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError> {
        *self.lock_calls().entry(function.to_string()).or_insert(0) += 1;

        let _in_flight = InFlight::enter(&self.stats);
        if let Some(delay) = self.delays.get(function) {
            tokio::time::sleep(*delay).await;
        }

        match self.replies.get(function) {
            Some(Reply::Echo) => Ok(args.to_vec()),
            Some(Reply::Fixed(body)) => Ok(body.clone()),
            None => Err(PlugdeskError::Runtime {
                plugin: self.name.clone(),
                message: format!("unknown function: {function}"),
            }),
        }
    }

    async fn shutdown(&mut self) -> Result<(), PlugdeskError> {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_and_counts() {
        let guest = MockGuest::new(r#"{"name":"alpha","version":"1"}"#)
            .with_echo("echo")
            .with_response("fixed", b"{}");
        let mut owned = guest.clone();

        assert_eq!(owned.register().await.unwrap(), br#"{"name":"alpha","version":"1"}"#);
        assert_eq!(owned.call("echo", b"[1]").await.unwrap(), b"[1]");
        assert_eq!(owned.call("fixed", b"null").await.unwrap(), b"{}");
        assert_eq!(guest.call_count("echo"), 1);
        assert_eq!(guest.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn unknown_function_is_a_runtime_error() {
        let mut guest = MockGuest::new(r#"{"name":"alpha"}"#);
        match guest.call("missing", b"{}").await {
            Err(PlugdeskError::Runtime { plugin, message }) => {
                assert_eq!(plugin, "alpha");
                assert!(message.contains("missing"));
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdowns_are_counted() {
        let guest = MockGuest::new(r#"{"name":"alpha"}"#);
        let counter = guest.shutdown_counter();
        guest.clone().shutdown().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
