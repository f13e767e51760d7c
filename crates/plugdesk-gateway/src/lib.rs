// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP surface for the Plugdesk extension runtime.
//!
//! First-class `/plugins` endpoints live on a static axum router. Everything
//! it does not match falls through to the [`RoutingEngine`], which serves
//! declarative routes and plugin-declared routes from an atomically swapped
//! snapshot.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod render;
pub mod routes_file;
pub mod routing;
pub mod server;

pub use auth::{AccessPolicy, Principal, SharedPolicy, TokenAccessPolicy};
pub use error::ApiError;
pub use handlers::builtin_handlers;
pub use render::{PageContext, PageRenderer, ShellRenderer};
pub use routes_file::{
    DeclarativeRouteSource, DeclaredRoute, FileRouteSource, HandlerRegistry, RouteAction,
    StaticRoutes,
};
pub use routing::{RouteDescriptor, RouteOrigin, RoutingEngine, RoutingSnapshot};
pub use server::{build_router, start_server, AppState, ServerConfig};
