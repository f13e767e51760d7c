// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hot reload: debounced filesystem watch of the plugin directory and the
//! declarative routes file.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use plugdesk_core::{PlugdeskError, PluginSource, RuntimeKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::packaging::{source_from_bundle, PACKAGE_DESCRIPTOR};
use crate::registry::PluginManager;

/// A change the host should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A package was added or modified.
    PluginChanged(String),
    /// A package disappeared from disk.
    PluginRemoved(String),
    /// The declarative routes file changed.
    RoutesChanged,
}

/// Keeps the underlying watcher alive. Dropping it stops event delivery.
pub struct PluginWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher").finish_non_exhaustive()
    }
}

impl PluginWatcher {
    /// Watch `plugin_dir` recursively and, if given, the routes file.
    pub fn start(
        plugin_dir: &Path,
        routes_file: Option<&Path>,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), PlugdeskError> {
        let plugin_dir = std::fs::canonicalize(plugin_dir)?;
        let routes_file = routes_file.map(absolute);
        let (tx, rx) = mpsc::unbounded_channel();

        let dir = plugin_dir.clone();
        let routes = routes_file.clone();
        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| {
            let events = match res {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "plugin watcher error");
                    return;
                }
            };
            let mut seen = Vec::new();
            for event in events {
                if let Some(change) = classify(&dir, routes.as_deref(), &event.path)
                    && !seen.contains(&change)
                {
                    seen.push(change);
                }
            }
            for change in seen {
                // Receiver gone means the host is shutting down.
                let _ = tx.send(change);
            }
        })
        .map_err(watch_err)?;

        debouncer
            .watcher()
            .watch(&plugin_dir, RecursiveMode::Recursive)
            .map_err(watch_err)?;
        if let Some(routes) = &routes_file
            && let Some(parent) = routes.parent()
            && !parent.starts_with(&plugin_dir)
        {
            // Editors replace files, so watch the directory rather than the file.
            debouncer
                .watcher()
                .watch(parent, RecursiveMode::NonRecursive)
                .map_err(watch_err)?;
        }

        info!(
            dir = %plugin_dir.display(),
            debounce_ms = debounce.as_millis() as u64,
            "watching plugin directory"
        );
        Ok((
            Self {
                _debouncer: debouncer,
            },
            rx,
        ))
    }
}

fn watch_err(e: notify_debouncer_mini::notify::Error) -> PlugdeskError {
    PlugdeskError::Internal(format!("file watcher: {e}"))
}

fn absolute(path: &Path) -> PathBuf {
    if let Some(parent) = path.parent()
        && let Ok(parent) = std::fs::canonicalize(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })
        && let Some(name) = path.file_name()
    {
        return parent.join(name);
    }
    path.to_path_buf()
}

/// Map a changed path to the event it implies, if any.
fn classify(plugin_dir: &Path, routes_file: Option<&Path>, path: &Path) -> Option<WatchEvent> {
    if routes_file.is_some_and(|r| r == path) {
        return Some(WatchEvent::RoutesChanged);
    }

    let relative = path.strip_prefix(plugin_dir).ok()?;
    let mut components = relative.components();
    let Some(Component::Normal(first)) = components.next() else {
        return None;
    };
    let first = first.to_str()?;
    if first.starts_with('.') {
        return None;
    }
    let top = plugin_dir.join(first);
    let nested = components.next().is_some();

    if !nested {
        if let Some(name) = first.strip_suffix(".wasm") {
            return Some(if top.exists() {
                WatchEvent::PluginChanged(name.to_string())
            } else {
                WatchEvent::PluginRemoved(name.to_string())
            });
        }
        if !top.exists() {
            return Some(WatchEvent::PluginRemoved(first.to_string()));
        }
    }
    if top.is_dir() {
        return Some(WatchEvent::PluginChanged(first.to_string()));
    }
    None
}

/// Bring the registry in line with a plugin change on disk.
///
/// Routes changes are left to the caller.
pub async fn apply_event(manager: &PluginManager, event: &WatchEvent) -> Result<(), PlugdeskError> {
    match event {
        WatchEvent::PluginChanged(name) => {
            let added = manager.discover()?;
            if added.contains(name) {
                debug!(plugin = %name, "new plugin picked up by watcher");
                return Ok(());
            }
            let Some(source) = resolve_source(manager.plugin_dir(), name)? else {
                return Ok(());
            };
            refresh(manager, source).await
        }
        WatchEvent::PluginRemoved(name) => {
            if manager.state(name).is_none() {
                return Ok(());
            }
            // A bundle may have replaced a bare module under the same name
            // within one batch; only unload when no package is left.
            match resolve_source(manager.plugin_dir(), name)? {
                Some(source) => refresh(manager, source).await,
                None => manager.unload(name).await,
            }
        }
        WatchEvent::RoutesChanged => Ok(()),
    }
}

async fn refresh(manager: &PluginManager, source: PluginSource) -> Result<(), PlugdeskError> {
    let name = source.name.clone();
    if manager.state(&name).is_some() && manager.register_source(source) {
        manager.reload(&name).await?;
    }
    Ok(())
}

fn resolve_source(plugin_dir: &Path, name: &str) -> Result<Option<PluginSource>, PlugdeskError> {
    let bundle = plugin_dir.join(name);
    if bundle.join(PACKAGE_DESCRIPTOR).is_file() {
        return source_from_bundle(&bundle).map(Some);
    }
    let module = plugin_dir.join(format!("{name}.wasm"));
    if module.is_file() {
        return Ok(Some(PluginSource {
            name: name.to_string(),
            runtime: RuntimeKind::Wasm,
            binary_path: module,
            root: plugin_dir.to_path_buf(),
        }));
    }
    Ok(None)
}
