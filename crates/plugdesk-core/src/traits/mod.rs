// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait seams between the host and guest runtimes.

pub mod guest;

pub use guest::{GuestInstance, GuestLoader};
