// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration system for the Plugdesk extension runtime.
//!
//! TOML files are layered with `PLUGDESK_*` environment overrides, rejected
//! on unknown keys, validated after deserialization, and rendered as miette
//! diagnostics with typo suggestions.
//!
//! # Usage
//!
//! ```no_run
//! use plugdesk_config::load_and_validate;
//!
//! let config = load_and_validate(None).expect("config errors");
//! println!("plugin dir: {}", config.plugins.dir);
//! ```

use std::path::Path;

pub mod diagnostic;
pub mod loader;
pub mod model;
pub mod validation;

pub use diagnostic::{render_errors, ConfigError};
pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::PlugdeskConfig;

/// Load configuration and validate it.
///
/// With `path = None` the standard hierarchy is used (system, XDG, local
/// file, then environment). With an explicit path only that file and the
/// environment are consulted.
pub fn load_and_validate(path: Option<&Path>) -> Result<PlugdeskConfig, Vec<ConfigError>> {
    let loaded = match path {
        Some(p) => {
            tracing::debug!(path = %p.display(), "loading configuration file");
            loader::load_config_from_path(p)
        }
        None => loader::load_config(),
    };
    match loaded {
        Ok(config) => {
            validation::validate_config(&config)?;
            Ok(config)
        }
        Err(err) => {
            let sources = match path {
                Some(p) => read_sources(&[p.to_path_buf()]),
                None => read_sources(&loader::standard_paths()),
            };
            Err(diagnostic::figment_to_config_errors(err, &sources))
        }
    }
}

/// Load configuration from a TOML string and validate it.
pub fn load_and_validate_str(toml_content: &str) -> Result<PlugdeskConfig, Vec<ConfigError>> {
    match loader::load_config_from_str(toml_content) {
        Ok(config) => {
            validation::validate_config(&config)?;
            Ok(config)
        }
        Err(err) => {
            let sources = vec![("<inline>".to_string(), toml_content.to_string())];
            Err(diagnostic::figment_to_config_errors(err, &sources))
        }
    }
}

/// Read the contents of whichever config files exist, for error spans.
fn read_sources(paths: &[std::path::PathBuf]) -> Vec<(String, String)> {
    paths
        .iter()
        .filter_map(|path| {
            let content = std::fs::read_to_string(path).ok()?;
            let display = std::fs::canonicalize(path)
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string();
            Some((display, content))
        })
        .collect()
}
