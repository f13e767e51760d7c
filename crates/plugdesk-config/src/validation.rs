// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.

use std::collections::HashSet;

use plugdesk_core::types::is_valid_plugin_name;

use crate::diagnostic::ConfigError;
use crate::model::PlugdeskConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration for semantic correctness.
///
/// Collects every problem instead of failing on the first one.
pub fn validate_config(config: &PlugdeskConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    let host = config.server.host.trim();
    if host.is_empty() {
        fail("server.host must not be empty".to_string());
    } else {
        let is_valid_ip = host.parse::<std::net::IpAddr>().is_ok();
        let is_valid_hostname = host
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == ':');
        if !is_valid_ip && !is_valid_hostname {
            fail(format!(
                "server.host `{host}` is not a valid IP address or hostname"
            ));
        }
    }

    if config.server.port == 0 {
        fail("server.port must be non-zero".to_string());
    }

    if config.server.upload_limit_mb == 0 {
        fail("server.upload_limit_mb must be at least 1".to_string());
    }

    let mut seen_tokens = HashSet::new();
    for (i, entry) in config.auth.tokens.iter().enumerate() {
        if entry.token.trim().is_empty() {
            fail(format!("auth.tokens[{i}].token must not be empty"));
        } else if !seen_tokens.insert(entry.token.as_str()) {
            fail(format!("auth.tokens[{i}] duplicates an earlier token"));
        }
        if entry.user.trim().is_empty() {
            fail(format!("auth.tokens[{i}].user must not be empty"));
        }
    }

    let plugins = &config.plugins;
    if plugins.dir.trim().is_empty() {
        fail("plugins.dir must not be empty".to_string());
    }
    if plugins.watch_debounce_ms < 50 {
        fail(format!(
            "plugins.watch_debounce_ms must be at least 50, got {}",
            plugins.watch_debounce_ms
        ));
    }
    if plugins.call_timeout_secs == 0 {
        fail("plugins.call_timeout_secs must be at least 1".to_string());
    }
    if plugins.log_capacity == 0 {
        fail("plugins.log_capacity must be at least 1".to_string());
    }
    if plugins.wasm_fuel == 0 {
        fail("plugins.wasm_fuel must be non-zero".to_string());
    }
    if plugins.wasm_max_memory_mb == 0 {
        fail("plugins.wasm_max_memory_mb must be at least 1".to_string());
    }
    for name in plugins.overrides.keys() {
        if !is_valid_plugin_name(name) {
            fail(format!(
                "plugins.overrides key `{name}` is not a valid plugin name"
            ));
        }
    }

    if let Some(file) = &config.routes.file
        && file.trim().is_empty()
    {
        fail("routes.file must not be empty when set".to_string());
    }

    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        fail(format!(
            "logging.level `{}` must be one of: {}",
            config.logging.level,
            LOG_LEVELS.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
