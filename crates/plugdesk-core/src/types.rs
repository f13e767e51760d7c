// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared across the registry, runtimes, and gateway.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle state of a plugin known to the registry.
///
/// `Discovered` plugins have no manifest yet. A plugin must pass through
/// `Loaded` before it can become `Enabled`. `Failed` sticks until a new
/// package is registered under the same name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Loaded,
    Enabled,
    Disabled,
    Failed,
}

impl PluginState {
    /// True once a guest instance exists for the plugin.
    pub fn is_loaded(self) -> bool {
        matches!(
            self,
            PluginState::Loaded | PluginState::Enabled | PluginState::Disabled
        )
    }
}

/// How a plugin's module is executed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// A WebAssembly module run in the embedded sandbox.
    Wasm,
    /// A native executable speaking newline-delimited JSON over stdio.
    Process,
}

/// Severity of a diagnostic log entry, ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Display size of a dashboard widget.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WidgetSize {
    Small,
    #[default]
    Medium,
    Large,
    Full,
}

/// A package on disk that the registry knows how to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSource {
    /// Registry key for the plugin.
    pub name: String,
    /// Execution mode of the module.
    pub runtime: RuntimeKind,
    /// Path of the module or executable.
    pub binary_path: PathBuf,
    /// Directory the module runs from (the bundle root, or the plugin dir for bare modules).
    pub root: PathBuf,
}

/// Plugin names are ASCII letters, digits, `-` and `_`.
///
/// The name doubles as a directory name under the plugin dir, so anything
/// that could form a path component other than a plain name is rejected.
pub fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
