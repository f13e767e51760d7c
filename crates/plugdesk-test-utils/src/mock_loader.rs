// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock guest loader keyed by plugin name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use plugdesk_core::{GuestInstance, GuestLoader, PlugdeskError, PluginSource};

use crate::mock_guest::MockGuest;

type Factory = Arc<dyn Fn() -> MockGuest + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Guest(Factory),
    Failure(String),
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    loads: HashMap<String, usize>,
}

/// Hands out [`MockGuest`]s by plugin name.
///
/// Clones share configuration, so a test can reconfigure a loader the
/// registry already owns.
#[derive(Clone, Default)]
pub struct MockLoader {
    state: Arc<Mutex<State>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh guest from `factory` on every load of `name`.
    pub fn with_plugin<F>(self, name: &str, factory: F) -> Self
    where
        F: Fn() -> MockGuest + Send + Sync + 'static,
    {
        self.set_plugin(name, factory);
        self
    }

    /// Hand out clones of `guest`, sharing its counters.
    pub fn with_instance(self, name: &str, guest: MockGuest) -> Self {
        self.with_plugin(name, move || guest.clone())
    }

    /// Fail every load of `name` with `message`.
    pub fn with_failure(self, name: &str, message: &str) -> Self {
        self.set_failure(name, message);
        self
    }

    pub fn set_plugin<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> MockGuest + Send + Sync + 'static,
    {
        self.lock()
            .entries
            .insert(name.to_string(), Entry::Guest(Arc::new(factory)));
    }

    pub fn set_failure(&self, name: &str, message: &str) {
        self.lock()
            .entries
            .insert(name.to_string(), Entry::Failure(message.to_string()));
    }

    /// Number of load attempts for `name`, failed ones included.
    pub fn load_count(&self, name: &str) -> usize {
        self.lock().loads.get(name).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl GuestLoader for MockLoader {
    async fn load(&self, source: &PluginSource) -> Result<Box<dyn GuestInstance>, PlugdeskError> {
        let entry = {
            let mut state = self.lock();
            *state.loads.entry(source.name.clone()).or_insert(0) += 1;
            state.entries.get(&source.name).cloned()
        };
        match entry {
            Some(Entry::Guest(factory)) => Ok(Box::new(factory())),
            Some(Entry::Failure(message)) => Err(PlugdeskError::Load {
                plugin: source.name.clone(),
                message,
            }),
            None => Err(PlugdeskError::Load {
                plugin: source.name.clone(),
                message: "no mock guest registered".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugdesk_core::RuntimeKind;

    fn source(name: &str) -> PluginSource {
        PluginSource {
            name: name.to_string(),
            runtime: RuntimeKind::Wasm,
            binary_path: format!("/plugins/{name}.wasm").into(),
            root: "/plugins".into(),
        }
    }

    #[tokio::test]
    async fn loads_and_counts() {
        let loader = MockLoader::new().with_plugin("alpha", || MockGuest::new(r#"{"name":"alpha"}"#));
        assert!(loader.load(&source("alpha")).await.is_ok());
        assert!(matches!(
            loader.load(&source("ghost")).await,
            Err(PlugdeskError::Load { .. })
        ));
        assert_eq!(loader.load_count("alpha"), 1);
        assert_eq!(loader.load_count("ghost"), 1);
    }

    #[tokio::test]
    async fn reconfigures_through_clones() {
        let loader = MockLoader::new().with_plugin("alpha", || MockGuest::new(r#"{"name":"alpha"}"#));
        let shared = loader.clone();
        loader.set_failure("alpha", "corrupt");
        match shared.load(&source("alpha")).await {
            Err(PlugdeskError::Load { message, .. }) => assert_eq!(message, "corrupt"),
            _ => panic!("expected load failure"),
        }
    }
}
