// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Plugdesk extension runtime.
//!
//! The registry, dispatcher and packaging code return these typed errors and
//! never build HTTP responses themselves. The gateway is the only place that
//! maps a variant to a status code.

use thiserror::Error;

/// The primary error type shared by all Plugdesk crates.
#[derive(Debug, Error)]
pub enum PlugdeskError {
    /// Unknown plugin, widget, or function.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// The plugin exists but is not enabled.
    #[error("plugin {name} is disabled")]
    Disabled { name: String },

    /// Bad upload, bad manifest, or bad arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// The guest trapped, threw, or its process failed mid-call.
    #[error("plugin {plugin} failed: {message}")]
    Runtime { plugin: String, message: String },

    /// Loading or initializing a guest failed.
    #[error("failed to load plugin {plugin}: {message}")]
    Load { plugin: String, message: String },

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem errors outside of validation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A guest call exceeded its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// The caller cancelled before the guest returned.
    #[error("call cancelled")]
    Cancelled,

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlugdeskError {
    /// Shorthand for an unknown plugin name.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        PlugdeskError::NotFound {
            kind: "plugin".to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for an unknown widget key.
    pub fn widget_not_found(plugin: &str, id: &str) -> Self {
        PlugdeskError::NotFound {
            kind: "widget".to_string(),
            name: format!("{plugin}:{id}"),
        }
    }

    /// True for errors that originate inside guest code rather than the host.
    pub fn is_guest_failure(&self) -> bool {
        matches!(
            self,
            PlugdeskError::Runtime { .. } | PlugdeskError::Timeout { .. }
        )
    }
}
