// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin registry and lifecycle manager.
//!
//! The [`PluginManager`] owns one record per known plugin, keyed by name.
//! Records move through `Discovered -> Loaded -> Enabled <-> Disabled`, with
//! `Failed` reachable from any load attempt. Loading is lazy and coalesced
//! per name; the record map's lock is never held while guest code runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use plugdesk_core::{
    is_valid_plugin_name, GuestLoader, LogLevel, PlugdeskError, PluginSource, PluginState,
    RuntimeKind,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::LoadedPlugin;
use crate::log_buffer::LogBuffer;
use crate::manifest::PluginManifest;
use crate::packaging::{source_from_bundle, PACKAGE_DESCRIPTOR};

/// Shared handle to a loaded plugin.
pub type PluginHandle = Arc<LoadedPlugin>;

/// Deepest directory level searched for bare modules.
const MAX_SCAN_DEPTH: usize = 4;

/// Host-side source name used for log entries not tied to one plugin.
const HOST_SOURCE: &str = "host";

/// Tunables for [`PluginManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub plugin_dir: PathBuf,
    /// Whether a freshly loaded plugin becomes `Enabled`.
    pub default_enabled: bool,
    /// Per-plugin enablement taking precedence over `default_enabled`.
    pub overrides: HashMap<String, bool>,
    /// Deadline for one guest call, including registration.
    pub call_timeout: Duration,
    pub log_capacity: usize,
}

impl ManagerSettings {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            default_enabled: true,
            overrides: HashMap::new(),
            call_timeout: Duration::from_secs(30),
            log_capacity: crate::log_buffer::DEFAULT_CAPACITY,
        }
    }
}

/// What changed in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryEventKind {
    Loaded,
    Enabled,
    Disabled,
    Reloaded,
    Removed,
    Failed,
}

/// Broadcast to subscribers whenever a plugin's visible surface may change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub plugin: String,
}

/// Snapshot of one plugin's registry record.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub state: PluginState,
    pub runtime: RuntimeKind,
    pub loaded: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct PluginRecord {
    source: PluginSource,
    state: PluginState,
    instance: Option<PluginHandle>,
    last_error: Option<String>,
    /// Enablement requested before the plugin was loaded.
    wants_enabled: Option<bool>,
}

impl PluginRecord {
    fn discovered(source: PluginSource) -> Self {
        Self {
            source,
            state: PluginState::Discovered,
            instance: None,
            last_error: None,
            wants_enabled: None,
        }
    }
}

/// Registry of plugins and their lifecycle.
///
/// Constructed once by the composition root and shared by `Arc`.
pub struct PluginManager {
    loader: Arc<dyn GuestLoader>,
    settings: ManagerSettings,
    records: RwLock<HashMap<String, PluginRecord>>,
    load_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    logs: Arc<LogBuffer>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_dir", &self.settings.plugin_dir)
            .field("plugins", &self.read().len())
            .finish()
    }
}

impl PluginManager {
    pub fn new(loader: Arc<dyn GuestLoader>, settings: ManagerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            loader,
            logs: Arc::new(LogBuffer::new(settings.log_capacity)),
            settings,
            records: RwLock::new(HashMap::new()),
            load_locks: DashMap::new(),
            events,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.settings.plugin_dir
    }

    /// The diagnostic log shared by every plugin.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Receive lifecycle events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Scan the plugin directory and record packages not yet known.
    ///
    /// Picks up bundle directories holding a `plugin.toml` and bare `.wasm`
    /// files in any other directory. Nothing is loaded. Returns the names of
    /// newly recorded plugins.
    pub fn discover(&self) -> Result<Vec<String>, PlugdeskError> {
        let dir = self.settings.plugin_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        self.scan_dir(&dir, 0, &mut found);

        let mut added = Vec::new();
        let mut records = self.write();
        for source in found {
            if records.contains_key(&source.name) {
                continue;
            }
            debug!(plugin = %source.name, path = %source.binary_path.display(), "discovered plugin");
            added.push(source.name.clone());
            records.insert(source.name.clone(), PluginRecord::discovered(source));
        }
        drop(records);

        if !added.is_empty() {
            info!(count = added.len(), dir = %dir.display(), "plugins discovered");
        }
        added.sort();
        Ok(added)
    }

    fn scan_dir(&self, dir: &Path, depth: usize, found: &mut Vec<PluginSource>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read plugin directory");
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }

            if path.is_dir() {
                if path.join(PACKAGE_DESCRIPTOR).is_file() {
                    match source_from_bundle(&path) {
                        Ok(source) => push_unique(found, source, &self.logs),
                        Err(e) => self.logs.log(
                            file_name,
                            LogLevel::Error,
                            format!("invalid plugin bundle: {e}"),
                            None,
                        ),
                    }
                } else if depth < MAX_SCAN_DEPTH {
                    self.scan_dir(&path, depth + 1, found);
                }
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some("wasm") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_plugin_name(name) {
                self.logs.log(
                    HOST_SOURCE,
                    LogLevel::Warn,
                    format!("skipping module with invalid plugin name: {}", path.display()),
                    None,
                );
                continue;
            }
            let source = PluginSource {
                name: name.to_string(),
                runtime: RuntimeKind::Wasm,
                root: dir.to_path_buf(),
                binary_path: path.clone(),
            };
            push_unique(found, source, &self.logs);
        }
    }

    /// Record a freshly packaged plugin.
    ///
    /// An existing record under the same name is superseded: a `Failed` or
    /// unloaded record re-enters `Discovered`, while a loaded instance keeps
    /// serving until [`reload`](Self::reload) replaces it. Returns `true` when
    /// an instance is currently serving and a reload is needed.
    pub fn register_source(&self, source: PluginSource) -> bool {
        let mut records = self.write();
        match records.get_mut(&source.name) {
            Some(record) => {
                record.source = source;
                record.last_error = None;
                if record.instance.is_some() {
                    true
                } else {
                    record.state = PluginState::Discovered;
                    false
                }
            }
            None => {
                records.insert(source.name.clone(), PluginRecord::discovered(source));
                false
            }
        }
    }

    /// Return a loaded handle, loading a `Discovered` plugin on first use.
    pub async fn get(&self, name: &str) -> Result<PluginHandle, PlugdeskError> {
        if let Some(handle) = self.loaded_instance(name)? {
            return Ok(handle);
        }

        let lock = self.load_lock(name);
        let _guard = lock.lock().await;

        // Another task may have finished the load while we waited.
        if let Some(handle) = self.loaded_instance(name)? {
            return Ok(handle);
        }

        let source = self.source(name)?;
        self.load_into_record(&source, false).await
    }

    fn loaded_instance(&self, name: &str) -> Result<Option<PluginHandle>, PlugdeskError> {
        let records = self.read();
        let record = records
            .get(name)
            .ok_or_else(|| PlugdeskError::plugin_not_found(name))?;
        if record.state == PluginState::Failed {
            return Err(PlugdeskError::Load {
                plugin: name.to_string(),
                message: record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "previous load failed".to_string()),
            });
        }
        Ok(record.instance.clone())
    }

    fn source(&self, name: &str) -> Result<PluginSource, PlugdeskError> {
        self.read()
            .get(name)
            .map(|r| r.source.clone())
            .ok_or_else(|| PlugdeskError::plugin_not_found(name))
    }

    fn load_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn initial_enablement(&self, name: &str, requested: Option<bool>) -> bool {
        requested
            .or_else(|| self.settings.overrides.get(name).copied())
            .unwrap_or(self.settings.default_enabled)
    }

    /// Instantiate `source` and install the instance. Caller holds the load lock.
    ///
    /// With `replace = true` an existing instance is swapped out and shut
    /// down; if the new load fails the old instance keeps serving.
    async fn load_into_record(
        &self,
        source: &PluginSource,
        replace: bool,
    ) -> Result<PluginHandle, PlugdeskError> {
        let name = source.name.as_str();
        let started = std::time::Instant::now();
        let loaded = self.instantiate(source).await;

        let mut events = Vec::new();
        let (result, retired) = {
            let mut records = self.write();
            match (records.get_mut(name), loaded) {
                // Unloaded while we were loading.
                (None, loaded) => (
                    Err(PlugdeskError::plugin_not_found(name)),
                    loaded.ok().map(Arc::new),
                ),
                (Some(record), Ok(plugin)) => {
                    let handle = Arc::new(plugin);
                    let previous = record.instance.replace(handle.clone());
                    let was_loaded = previous.is_some();
                    record.last_error = None;
                    if !was_loaded {
                        let enabled = self.initial_enablement(name, record.wants_enabled);
                        record.state = if enabled {
                            PluginState::Enabled
                        } else {
                            PluginState::Loaded
                        };
                        record.wants_enabled = None;
                        events.push(RegistryEventKind::Loaded);
                        if enabled {
                            events.push(RegistryEventKind::Enabled);
                        }
                    } else {
                        events.push(RegistryEventKind::Reloaded);
                    }
                    (Ok(handle), previous)
                }
                (Some(record), Err(e)) => {
                    let message = e.to_string();
                    record.last_error = Some(message.clone());
                    if !(replace && record.instance.is_some()) {
                        record.state = PluginState::Failed;
                        events.push(RegistryEventKind::Failed);
                    }
                    (
                        Err(PlugdeskError::Load {
                            plugin: name.to_string(),
                            message,
                        }),
                        None,
                    )
                }
            }
        };

        match &result {
            Ok(handle) => self.logs.log(
                name,
                LogLevel::Info,
                format!(
                    "{} {} v{} ({})",
                    if retired.is_some() { "reloaded" } else { "loaded" },
                    name,
                    handle.manifest().version,
                    handle.runtime()
                ),
                Some(serde_json::json!({ "elapsed_ms": started.elapsed().as_millis() as u64 })),
            ),
            Err(e) => self.logs.log(name, LogLevel::Error, e.to_string(), None),
        }

        for kind in events {
            self.emit(kind, name);
        }
        if let Some(old) = retired {
            shutdown_quietly(&old).await;
        }
        result
    }

    async fn instantiate(&self, source: &PluginSource) -> Result<LoadedPlugin, PlugdeskError> {
        let guest = self.loader.load(source).await?;
        LoadedPlugin::bootstrap(&source.name, guest, self.settings.call_timeout).await
    }

    /// Enable a plugin, loading it first if needed. Idempotent.
    pub async fn enable(&self, name: &str) -> Result<(), PlugdeskError> {
        self.get(name).await?;
        let changed = {
            let mut records = self.write();
            let record = records
                .get_mut(name)
                .ok_or_else(|| PlugdeskError::plugin_not_found(name))?;
            let changed = record.state != PluginState::Enabled;
            record.state = PluginState::Enabled;
            changed
        };
        if changed {
            self.logs.log(name, LogLevel::Info, "enabled", None);
            self.emit(RegistryEventKind::Enabled, name);
        }
        Ok(())
    }

    /// Disable a plugin. Idempotent and never unloads.
    ///
    /// For a plugin that is not loaded yet the request is remembered and
    /// applied when it loads.
    pub fn disable(&self, name: &str) -> Result<(), PlugdeskError> {
        let changed = {
            let mut records = self.write();
            let record = records
                .get_mut(name)
                .ok_or_else(|| PlugdeskError::plugin_not_found(name))?;
            if record.state.is_loaded() {
                let changed = record.state != PluginState::Disabled;
                record.state = PluginState::Disabled;
                changed
            } else {
                record.wants_enabled = Some(false);
                false
            }
        };
        if changed {
            self.logs.log(name, LogLevel::Info, "disabled", None);
            self.emit(RegistryEventKind::Disabled, name);
        }
        Ok(())
    }

    /// Manifests of loaded plugins, sorted by name.
    pub fn list(&self) -> Vec<Arc<PluginManifest>> {
        let mut manifests: Vec<_> = self
            .read()
            .values()
            .filter_map(|r| r.instance.as_ref().map(|i| i.manifest().clone()))
            .collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    /// Names of plugins known but not loaded yet, sorted.
    pub fn discovered(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, r)| r.state == PluginState::Discovered)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of every known plugin, sorted.
    pub fn known(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.state(name) == Some(PluginState::Enabled)
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.read().get(name).map(|r| r.state)
    }

    /// Manifest of a loaded plugin, without loading it.
    pub fn manifest(&self, name: &str) -> Option<Arc<PluginManifest>> {
        self.read()
            .get(name)
            .and_then(|r| r.instance.as_ref().map(|i| i.manifest().clone()))
    }

    /// Every known plugin with its state, sorted by name.
    pub fn status(&self) -> Vec<PluginStatus> {
        let mut out: Vec<_> = self
            .read()
            .iter()
            .map(|(name, record)| {
                let manifest = record.instance.as_ref().map(|i| i.manifest().clone());
                PluginStatus {
                    name: name.clone(),
                    state: record.state,
                    runtime: record.source.runtime,
                    loaded: record.instance.is_some(),
                    enabled: record.state == PluginState::Enabled,
                    version: manifest.as_ref().map(|m| m.version.clone()),
                    description: manifest
                        .as_ref()
                        .map(|m| m.description.clone())
                        .filter(|d| !d.is_empty()),
                    path: record.source.binary_path.clone(),
                    last_error: record.last_error.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Enabled plugins and their instances, read in one consistent pass.
    pub fn enabled_plugins(&self) -> Vec<PluginHandle> {
        let mut handles: Vec<_> = self
            .read()
            .values()
            .filter(|r| r.state == PluginState::Enabled)
            .filter_map(|r| r.instance.clone())
            .collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    /// Invoke an export on an enabled plugin with the default deadline.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        name: &str,
        function: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, PlugdeskError> {
        self.call_with_timeout(cancel, name, function, args, self.settings.call_timeout)
            .await
    }

    /// Invoke an export on an enabled plugin with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        cancel: &CancellationToken,
        name: &str,
        function: &str,
        args: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, PlugdeskError> {
        let handle = self.get(name).await?;
        if !self.is_enabled(name) {
            return Err(PlugdeskError::Disabled {
                name: name.to_string(),
            });
        }

        let result = handle.invoke(cancel, function, args, deadline).await;
        if let Err(e) = &result
            && e.is_guest_failure()
        {
            self.logs.log(
                name,
                LogLevel::Error,
                format!("{function} failed: {e}"),
                None,
            );
        }
        result
    }

    /// Plugin-to-plugin call. Errors name the calling plugin.
    pub async fn call_from(
        &self,
        caller: &str,
        cancel: &CancellationToken,
        target: &str,
        function: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, PlugdeskError> {
        if caller == target {
            // The caller holds its own instance lock for the duration of its call.
            return Err(PlugdeskError::Validation(format!(
                "plugin {caller} cannot call itself"
            )));
        }
        debug!(caller, target, function, "plugin-to-plugin call");
        self.call(cancel, target, function, args)
            .await
            .map_err(|e| match e {
                PlugdeskError::Runtime { plugin, message } => PlugdeskError::Runtime {
                    plugin,
                    message: format!("{message} (called from {caller})"),
                },
                other => other,
            })
    }

    /// Discover and load every plugin. Failures are isolated per plugin.
    ///
    /// Returns the names that loaded successfully.
    pub async fn discover_and_load_all(&self) -> Result<Vec<String>, PlugdeskError> {
        self.discover()?;
        let mut loaded = Vec::new();
        for name in self.known() {
            match self.get(&name).await {
                Ok(_) => loaded.push(name),
                Err(e) => warn!(plugin = %name, error = %e, "plugin failed to load"),
            }
        }
        Ok(loaded)
    }

    /// Load a fresh instance from disk and swap it in, preserving enablement.
    ///
    /// If the plugin was serving and the new load fails, the old instance
    /// stays in place and the error is returned.
    pub async fn reload(&self, name: &str) -> Result<PluginHandle, PlugdeskError> {
        let lock = self.load_lock(name);
        let _guard = lock.lock().await;
        let source = self.source(name)?;
        {
            let mut records = self.write();
            if let Some(record) = records.get_mut(name)
                && record.state == PluginState::Failed
            {
                record.state = PluginState::Discovered;
            }
        }
        self.load_into_record(&source, true).await
    }

    /// Shut down and forget a plugin.
    pub async fn unload(&self, name: &str) -> Result<(), PlugdeskError> {
        let lock = self.load_lock(name);
        let _guard = lock.lock().await;
        let record = self
            .write()
            .remove(name)
            .ok_or_else(|| PlugdeskError::plugin_not_found(name))?;
        if let Some(instance) = record.instance {
            shutdown_quietly(&instance).await;
        }
        self.load_locks.remove(name);
        self.logs.log(name, LogLevel::Info, "unloaded", None);
        self.emit(RegistryEventKind::Removed, name);
        Ok(())
    }

    /// Shut down every loaded instance and clear the registry.
    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.write().drain().collect();
        for (name, record) in drained {
            if let Some(instance) = record.instance {
                shutdown_quietly(&instance).await;
                debug!(plugin = %name, "plugin shut down");
            }
        }
        self.load_locks.clear();
        info!("all plugins shut down");
    }

    fn emit(&self, kind: RegistryEventKind, plugin: &str) {
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent {
            kind,
            plugin: plugin.to_string(),
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PluginRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PluginRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn push_unique(found: &mut Vec<PluginSource>, source: PluginSource, logs: &LogBuffer) {
    if let Some(existing) = found.iter().find(|s| s.name == source.name) {
        logs.log(
            &source.name,
            LogLevel::Warn,
            format!(
                "duplicate plugin name; keeping {} and ignoring {}",
                existing.binary_path.display(),
                source.binary_path.display()
            ),
            None,
        );
        return;
    }
    found.push(source);
}

async fn shutdown_quietly(plugin: &LoadedPlugin) {
    if let Err(e) = plugin.shutdown().await {
        warn!(plugin = %plugin.name(), error = %e, "guest shutdown failed");
    }
}
