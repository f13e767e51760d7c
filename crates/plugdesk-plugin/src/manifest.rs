// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin manifests and package descriptors.
//!
//! Two documents describe a plugin. The *package descriptor* (`plugin.toml`)
//! ships inside an archive and tells the host how to run the module. The
//! *manifest* is JSON returned by the guest's registration export once it is
//! running, and lists the routes, widgets, jobs and menu entries it provides.

use std::collections::HashSet;
use std::str::FromStr;

use plugdesk_core::{is_valid_plugin_name, PlugdeskError, RuntimeKind, WidgetSize};
use serde::{Deserialize, Serialize};

/// HTTP methods a plugin route may declare.
pub const ROUTE_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Capabilities a loaded plugin declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub menu_items: Vec<MenuItemSpec>,
    /// Host menu item ids this plugin asks to hide.
    #[serde(default)]
    pub hide_menu_items: Vec<String>,
    /// Path the host should land on after login, if this plugin owns it.
    #[serde(default)]
    pub landing_page: Option<String>,
}

/// An HTTP route contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
    /// Export invoked for matching requests. Resolved at call time.
    pub handler: String,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// A dashboard widget contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub handler: String,
    #[serde(default = "default_widget_location")]
    pub location: String,
    #[serde(default)]
    pub size: WidgetSize,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub refreshable: bool,
    #[serde(default, rename = "refresh_sec", alias = "refresh_interval_seconds")]
    pub refresh_interval_seconds: u32,
}

fn default_widget_location() -> String {
    "dashboard".to_string()
}

/// A scheduled background job contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub handler: String,
    /// Cron expression (five or six fields).
    pub schedule: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-run deadline in seconds; the scheduler default applies when unset.
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// A navigation entry contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItemSpec {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub icon: String,
    pub path: String,
    #[serde(default = "default_menu_location")]
    pub location: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub children: Vec<MenuItemSpec>,
}

fn default_menu_location() -> String {
    "main".to_string()
}

impl PluginManifest {
    /// Check structural rules a guest cannot be trusted to follow.
    pub fn validate(&self) -> Result<(), PlugdeskError> {
        let invalid = |msg: String| Err(PlugdeskError::Validation(format!("manifest: {msg}")));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".to_string());
        }
        if !is_valid_plugin_name(&self.name) {
            return invalid(format!("name `{}` is not a valid plugin name", self.name));
        }
        if self.version.trim().is_empty() {
            return invalid("version must not be empty".to_string());
        }

        for route in &self.routes {
            let method = route.method.to_ascii_uppercase();
            if !ROUTE_METHODS.contains(&method.as_str()) {
                return invalid(format!(
                    "route {} has unsupported method `{}`",
                    route.path, route.method
                ));
            }
            if !route.path.starts_with('/') {
                return invalid(format!("route path `{}` must start with /", route.path));
            }
            if route.handler.trim().is_empty() {
                return invalid(format!("route {} {} has no handler", method, route.path));
            }
        }

        let mut widget_ids = HashSet::new();
        for widget in &self.widgets {
            if widget.id.trim().is_empty() || widget.handler.trim().is_empty() {
                return invalid("widgets need an id and a handler".to_string());
            }
            if !widget_ids.insert(widget.id.as_str()) {
                return invalid(format!("duplicate widget id `{}`", widget.id));
            }
        }

        for job in &self.jobs {
            if job.handler.trim().is_empty() {
                return invalid(format!("job `{}` has no handler", job.id));
            }
            croner::Cron::from_str(&job.schedule).map_err(|e| {
                PlugdeskError::Validation(format!(
                    "manifest: job `{}` has invalid schedule `{}`: {e}",
                    job.id, job.schedule
                ))
            })?;
        }

        Ok(())
    }
}

/// Parse and validate the JSON returned by a guest's registration export.
pub fn parse_guest_manifest(bytes: &[u8]) -> Result<PluginManifest, PlugdeskError> {
    let manifest: PluginManifest = serde_json::from_slice(bytes)
        .map_err(|e| PlugdeskError::Validation(format!("invalid plugin manifest: {e}")))?;
    manifest.validate()?;
    Ok(manifest)
}

/// The `plugin.toml` descriptor shipped inside an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    /// Explicit runtime, or `None` to infer from the bundle contents.
    pub runtime: Option<RuntimeKind>,
    /// Executable for process plugins, relative to the bundle root.
    pub binary: Option<String>,
    /// Module file for WASM plugins, relative to the bundle root.
    pub wasm: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageFile {
    plugin: PackageSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageSection {
    name: String,
    version: String,
    runtime: Option<String>,
    binary: Option<String>,
    wasm: Option<String>,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    homepage: Option<String>,
}

/// Parse a `plugin.toml` package descriptor.
pub fn parse_package_descriptor(toml_content: &str) -> Result<PackageDescriptor, PlugdeskError> {
    let file: PackageFile = toml::from_str(toml_content)
        .map_err(|e| PlugdeskError::Validation(format!("invalid plugin.toml: {e}")))?;
    let section = file.plugin;

    if !is_valid_plugin_name(&section.name) {
        return Err(PlugdeskError::Validation(format!(
            "plugin.toml: name `{}` is not a valid plugin name",
            section.name
        )));
    }
    if section.version.trim().is_empty() {
        return Err(PlugdeskError::Validation(
            "plugin.toml: version must not be empty".to_string(),
        ));
    }

    let runtime = match section.runtime.as_deref() {
        None => None,
        Some(raw) => Some(RuntimeKind::from_str(raw).map_err(|_| {
            PlugdeskError::Validation(format!(
                "plugin.toml: unsupported runtime `{raw}`. Expected one of: wasm, process"
            ))
        })?),
    };

    for rel in [section.binary.as_deref(), section.wasm.as_deref()]
        .into_iter()
        .flatten()
    {
        let path = std::path::Path::new(rel);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(PlugdeskError::Validation(format!(
                "plugin.toml: module path `{rel}` must stay inside the bundle"
            )));
        }
    }

    Ok(PackageDescriptor {
        name: section.name,
        version: section.version,
        runtime,
        binary: section.binary,
        wasm: section.wasm,
        description: section.description,
        author: section.author,
        license: section.license,
        homepage: section.homepage,
    })
}
