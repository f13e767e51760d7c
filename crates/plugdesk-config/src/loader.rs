// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered configuration loading with Figment.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `/etc/plugdesk/plugdesk.toml`
//! 3. `~/.config/plugdesk/plugdesk.toml`
//! 4. `./plugdesk.toml`
//! 5. `PLUGDESK_*` environment variables

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::PlugdeskConfig;

/// Top-level sections that environment variables may address.
const SECTIONS: &[&str] = &["server", "auth", "plugins", "routes", "logging"];

/// Config file locations in merge order.
pub fn standard_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/plugdesk/plugdesk.toml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("plugdesk/plugdesk.toml"));
    }
    paths.push(PathBuf::from("plugdesk.toml"));
    paths
}

/// Load configuration from the standard hierarchy with env var overrides.
pub fn load_config() -> Result<PlugdeskConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no files, no environment).
pub fn load_config_from_str(toml_content: &str) -> Result<PlugdeskConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(PlugdeskConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from an explicit file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<PlugdeskConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(PlugdeskConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// The Figment behind [`load_config`], before extraction.
pub fn build_figment() -> Figment {
    standard_paths()
        .into_iter()
        .fold(
            Figment::new().merge(Serialized::defaults(PlugdeskConfig::default())),
            |figment, path| figment.merge(Toml::file(path)),
        )
        .merge(env_provider())
}

/// Environment provider mapping `PLUGDESK_<SECTION>_<KEY>` to `section.key`.
///
/// Only the first underscore after a known section name becomes a dot, so
/// `PLUGDESK_PLUGINS_CALL_TIMEOUT_SECS` maps to `plugins.call_timeout_secs`.
fn env_provider() -> Env {
    Env::prefixed("PLUGDESK_").map(|key| {
        let key_str = key.as_str().to_ascii_lowercase();
        for section in SECTIONS {
            if let Some(rest) = key_str
                .strip_prefix(section)
                .and_then(|r| r.strip_prefix('_'))
            {
                return format!("{section}.{rest}").into();
            }
        }
        key_str.into()
    })
}
