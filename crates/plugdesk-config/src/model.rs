// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs.
//!
//! All structs use `#[serde(deny_unknown_fields)]` so a misspelled key fails
//! at startup instead of silently falling back to a default.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level Plugdesk configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlugdeskConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bearer tokens accepted by the plugin API.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Plugin directory, loading, and sandbox settings.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Declarative route file settings.
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted upload size in megabytes.
    #[serde(default = "default_upload_limit_mb")]
    pub upload_limit_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upload_limit_mb: default_upload_limit_mb(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upload_limit_mb() -> usize {
    32
}

/// Accepted bearer tokens.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Token entries. With no entries every protected request is rejected.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A single bearer token and the principal it authenticates as.
#[derive(Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// The secret bearer token.
    pub token: String,

    /// User id reported to plugins as `_user_id`.
    pub user: String,

    /// Whether the principal may administer plugins.
    #[serde(default)]
    pub admin: bool,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("token", &"[redacted]")
            .field("user", &self.user)
            .field("admin", &self.admin)
            .finish()
    }
}

/// Plugin runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Directory scanned for plugin packages.
    #[serde(default = "default_plugin_dir")]
    pub dir: String,

    /// Defer loading until first use. When false every discovered plugin is loaded at startup.
    #[serde(default = "default_true")]
    pub lazy: bool,

    /// Watch the plugin directory and route file for changes.
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Debounce window for filesystem events.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Upper bound on a single guest call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Capacity of the diagnostic log ring.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Whether a freshly loaded plugin starts enabled.
    #[serde(default = "default_true")]
    pub default_enabled: bool,

    /// Per-plugin enablement overriding `default_enabled`.
    #[serde(default)]
    pub overrides: HashMap<String, bool>,

    /// Fuel granted to each WASM call.
    #[serde(default = "default_wasm_fuel")]
    pub wasm_fuel: u64,

    /// Linear memory ceiling for each WASM instance.
    #[serde(default = "default_wasm_max_memory_mb")]
    pub wasm_max_memory_mb: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            lazy: true,
            hot_reload: true,
            watch_debounce_ms: default_watch_debounce_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            log_capacity: default_log_capacity(),
            default_enabled: true,
            overrides: HashMap::new(),
            wasm_fuel: default_wasm_fuel(),
            wasm_max_memory_mb: default_wasm_max_memory_mb(),
        }
    }
}

fn default_plugin_dir() -> String {
    "plugins".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_debounce_ms() -> u64 {
    500
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_log_capacity() -> usize {
    1000
}

fn default_wasm_fuel() -> u64 {
    1_000_000_000
}

fn default_wasm_max_memory_mb() -> usize {
    64
}

/// Declarative route file configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutesConfig {
    /// Path to the TOML route file. No declarative routes when unset.
    #[serde(default)]
    pub file: Option<String>,
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
