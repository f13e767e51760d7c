// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin registry, lifecycle, and host-to-guest dispatch.
//!
//! [`PluginManager`] is the single owner of plugin records. It discovers
//! packages on disk, loads them lazily through a [`plugdesk_core::GuestLoader`],
//! gates dispatch on enablement, and broadcasts [`RegistryEvent`]s so the
//! routing layer can rebuild when the set of visible routes changes.

pub mod aggregator;
pub mod dispatcher;
pub mod jobs;
pub mod log_buffer;
pub mod manifest;
pub mod packaging;
pub mod registry;
pub mod runtime;
pub mod watcher;

pub use aggregator::{MenuEntry, RenderedWidget, WidgetEntry};
pub use dispatcher::LoadedPlugin;
pub use jobs::{JobScheduler, ScheduledJob};
pub use log_buffer::{LogBuffer, LogEntry, LogQuery};
pub use manifest::{
    parse_guest_manifest, parse_package_descriptor, JobSpec, MenuItemSpec, PackageDescriptor,
    PluginManifest, RouteSpec, WidgetSpec,
};
pub use packaging::{install_upload, PackagedPlugin};
pub use registry::{
    ManagerSettings, PluginHandle, PluginManager, PluginStatus, RegistryEvent, RegistryEventKind,
};
pub use runtime::{
    HostApi, ManagerHostApi, ProcessRuntime, RuntimeLoader, WasmRuntime, WasmSettings,
};
pub use watcher::{apply_event, PluginWatcher, WatchEvent};
