// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Plugdesk integration tests.
//!
//! Provides in-memory guests and loaders so registry, dispatch and gateway
//! behavior can be tested without compiling real plugin modules.
//!
//! # Components
//!
//! - [`MockGuest`] - Guest instance with scripted responses and call counters
//! - [`MockLoader`] - Loader handing out mock guests or scripted load failures
//! - [`archive`] - Builders for zip and tar.gz upload payloads

pub mod archive;
pub mod mock_guest;
pub mod mock_loader;

pub use mock_guest::MockGuest;
pub use mock_loader::MockLoader;
