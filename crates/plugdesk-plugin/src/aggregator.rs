// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Widget and menu aggregation across enabled plugins.

use std::collections::BTreeSet;

use futures::future::join_all;
use plugdesk_core::{LogLevel, PlugdeskError, WidgetSize};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::manifest::{MenuItemSpec, WidgetSpec};
use crate::registry::PluginManager;

/// A widget annotated with the plugin that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetEntry {
    pub plugin: String,
    #[serde(flatten)]
    pub widget: WidgetSpec,
}

impl WidgetEntry {
    /// Externally visible key, `plugin:id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.plugin, self.widget.id)
    }
}

/// Output of a widget handler.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedWidget {
    pub plugin: String,
    pub id: String,
    pub title: String,
    pub size: WidgetSize,
    pub html: String,
}

/// A menu item annotated with the plugin that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct MenuEntry {
    pub plugin: String,
    #[serde(flatten)]
    pub item: MenuItemSpec,
}

#[derive(Deserialize)]
struct WidgetOutput {
    html: String,
}

impl PluginManager {
    /// Widgets for `location` from enabled plugins, loading discovered plugins first.
    ///
    /// Load failures are recorded in the log buffer and otherwise ignored.
    pub async fn all_widgets(&self, location: &str) -> Vec<WidgetEntry> {
        for name in self.discovered() {
            if let Err(e) = self.get(&name).await {
                tracing::debug!(plugin = %name, error = %e, "skipping plugin for widgets");
            }
        }
        self.widgets(location)
    }

    /// Widgets for `location` from plugins that are already loaded and enabled.
    pub fn widgets(&self, location: &str) -> Vec<WidgetEntry> {
        let mut entries: Vec<WidgetEntry> = self
            .enabled_plugins()
            .iter()
            .flat_map(|plugin| {
                plugin
                    .manifest()
                    .widgets
                    .iter()
                    .filter(|w| w.location == location)
                    .map(|w| WidgetEntry {
                        plugin: plugin.name().to_string(),
                        widget: w.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| {
            a.widget
                .order
                .cmp(&b.widget.order)
                .then_with(|| a.plugin.cmp(&b.plugin))
                .then_with(|| a.widget.id.cmp(&b.widget.id))
        });
        entries
    }

    /// Render every widget at `location`. Failing widgets are logged and omitted.
    pub async fn render_widgets(
        &self,
        cancel: &CancellationToken,
        location: &str,
        args: &[u8],
    ) -> Vec<RenderedWidget> {
        let entries = self.all_widgets(location).await;
        let rendered = join_all(
            entries
                .iter()
                .map(|entry| self.render_entry(cancel, entry, args)),
        )
        .await;

        entries
            .iter()
            .zip(rendered)
            .filter_map(|(entry, result)| match result {
                Ok(widget) => Some(widget),
                Err(e) => {
                    self.logs().log(
                        &entry.plugin,
                        LogLevel::Warn,
                        format!("widget {} failed to render: {e}", entry.widget.id),
                        None,
                    );
                    None
                }
            })
            .collect()
    }

    /// Render one widget by plugin name and widget id.
    pub async fn render_widget(
        &self,
        cancel: &CancellationToken,
        plugin: &str,
        id: &str,
        args: &[u8],
    ) -> Result<RenderedWidget, PlugdeskError> {
        let handle = self.get(plugin).await?;
        if !self.is_enabled(plugin) {
            return Err(PlugdeskError::Disabled {
                name: plugin.to_string(),
            });
        }
        let widget = handle
            .manifest()
            .widgets
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| PlugdeskError::widget_not_found(plugin, id))?;

        self.render_entry(
            cancel,
            &WidgetEntry {
                plugin: plugin.to_string(),
                widget,
            },
            args,
        )
        .await
    }

    async fn render_entry(
        &self,
        cancel: &CancellationToken,
        entry: &WidgetEntry,
        args: &[u8],
    ) -> Result<RenderedWidget, PlugdeskError> {
        let bytes = self
            .call(cancel, &entry.plugin, &entry.widget.handler, args)
            .await?;
        let output: WidgetOutput =
            serde_json::from_slice(&bytes).map_err(|e| PlugdeskError::Runtime {
                plugin: entry.plugin.clone(),
                message: format!("widget {} returned no html: {e}", entry.widget.id),
            })?;
        Ok(RenderedWidget {
            plugin: entry.plugin.clone(),
            id: entry.widget.id.clone(),
            title: entry.widget.title.clone(),
            size: entry.widget.size,
            html: output.html,
        })
    }

    /// Menu items for `location` from enabled plugins, sorted by order.
    pub fn menu_items(&self, location: &str) -> Vec<MenuEntry> {
        let mut entries: Vec<MenuEntry> = self
            .enabled_plugins()
            .iter()
            .flat_map(|plugin| {
                plugin
                    .manifest()
                    .menu_items
                    .iter()
                    .filter(|m| m.location == location)
                    .map(|m| MenuEntry {
                        plugin: plugin.name().to_string(),
                        item: m.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| {
            a.item
                .order
                .cmp(&b.item.order)
                .then_with(|| a.plugin.cmp(&b.plugin))
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        entries
    }

    /// Host menu ids that enabled plugins ask to hide, deduplicated.
    pub fn hidden_menu_items(&self) -> Vec<String> {
        self.enabled_plugins()
            .iter()
            .flat_map(|p| p.manifest().hide_menu_items.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Landing page of the first enabled plugin (by name) that declares one.
    pub fn landing_page(&self) -> Option<String> {
        self.enabled_plugins()
            .iter()
            .find_map(|p| p.manifest().landing_page.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use plugdesk_core::{PluginSource, RuntimeKind};
    use plugdesk_test_utils::{MockGuest, MockLoader};

    use crate::registry::ManagerSettings;

    use super::*;

    const ALPHA: &str = r#"{
        "name":"alpha","version":"1",
        "widgets":[
            {"id":"b","title":"B","handler":"render_b","order":2},
            {"id":"a","title":"A","handler":"render_a","order":2},
            {"id":"side","title":"Side","handler":"render_a","location":"sidebar"}
        ],
        "menu_items":[{"id":"m","label":"Alpha","path":"/alpha","order":5}],
        "hide_menu_items":["kb"],
        "landing_page":"/alpha"
    }"#;

    const BETA: &str = r#"{
        "name":"beta","version":"1",
        "widgets":[{"id":"first","title":"First","handler":"broken","order":1}],
        "menu_items":[{"id":"m","label":"Beta","path":"/beta","order":1}],
        "hide_menu_items":["kb","reports"]
    }"#;

    fn source(dir: &Path, name: &str) -> PluginSource {
        PluginSource {
            name: name.to_string(),
            runtime: RuntimeKind::Wasm,
            binary_path: dir.join(format!("{name}.wasm")),
            root: dir.to_path_buf(),
        }
    }

    fn manager(dir: &Path) -> PluginManager {
        let loader = MockLoader::new()
            .with_plugin("alpha", || {
                MockGuest::new(ALPHA)
                    .with_response("render_a", br#"{"html":"<p>a</p>"}"#)
                    .with_response("render_b", br#"{"html":"<p>b</p>"}"#)
            })
            .with_plugin("beta", || {
                MockGuest::new(BETA).with_response("broken", b"not json")
            });
        let manager = PluginManager::new(Arc::new(loader), ManagerSettings::new(dir));
        manager.register_source(source(dir, "alpha"));
        manager.register_source(source(dir, "beta"));
        manager
    }

    #[tokio::test]
    async fn all_widgets_loads_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.widgets("dashboard").is_empty());

        let keys: Vec<_> = manager
            .all_widgets("dashboard")
            .await
            .iter()
            .map(WidgetEntry::key)
            .collect();
        assert_eq!(keys, vec!["beta:first", "alpha:a", "alpha:b"]);
        assert_eq!(manager.widgets("sidebar").len(), 1);
    }

    #[tokio::test]
    async fn disabled_plugins_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.all_widgets("dashboard").await;
        manager.disable("beta").unwrap();

        let widgets = manager.all_widgets("dashboard").await;
        assert!(widgets.iter().all(|w| w.plugin == "alpha"));
        assert_eq!(manager.hidden_menu_items(), vec!["kb"]);
        assert_eq!(manager.menu_items("main").len(), 1);
    }

    #[tokio::test]
    async fn render_widgets_omits_failures() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let rendered = manager
            .render_widgets(&CancellationToken::new(), "dashboard", b"{}")
            .await;
        let ids: Vec<_> = rendered.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(
            manager
                .logs()
                .by_plugin("beta")
                .iter()
                .any(|e| e.message.contains("failed to render"))
        );
    }

    #[tokio::test]
    async fn render_widget_resolves_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let cancel = CancellationToken::new();

        let widget = manager.render_widget(&cancel, "alpha", "a", b"").await.unwrap();
        assert_eq!(widget.html, "<p>a</p>");
        assert_eq!(widget.title, "A");

        let missing = manager
            .render_widget(&cancel, "alpha", "zzz", b"")
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("alpha:zzz"));

        let ghost = manager
            .render_widget(&cancel, "ghost", "a", b"")
            .await
            .unwrap_err();
        assert!(matches!(ghost, PlugdeskError::NotFound { .. }));

        manager.disable("alpha").unwrap();
        let disabled = manager
            .render_widget(&cancel, "alpha", "a", b"")
            .await
            .unwrap_err();
        assert!(matches!(disabled, PlugdeskError::Disabled { .. }));
    }

    #[tokio::test]
    async fn menus_and_landing_page() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.all_widgets("dashboard").await;

        let labels: Vec<_> = manager
            .menu_items("main")
            .into_iter()
            .map(|m| m.item.label)
            .collect();
        assert_eq!(labels, vec!["Beta", "Alpha"]);
        assert_eq!(manager.hidden_menu_items(), vec!["kb", "reports"]);
        assert_eq!(manager.landing_page().as_deref(), Some("/alpha"));
    }
}
