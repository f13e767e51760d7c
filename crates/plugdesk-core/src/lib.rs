// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Plugdesk extension runtime.
//!
//! This crate holds the pieces every other Plugdesk crate agrees on: the
//! error taxonomy that HTTP handlers translate into status codes, the plugin
//! lifecycle and runtime enums, and the narrow byte-oriented traits that
//! guest runtimes implement.

pub mod error;
pub mod traits;
pub mod types;

pub use error::PlugdeskError;
pub use types::{
    is_valid_plugin_name, LogLevel, PluginSource, PluginState, RuntimeKind, WidgetSize,
};

pub use traits::{GuestInstance, GuestLoader};
