// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway HTTP server built on axum.
//!
//! Fixed `/plugins` API routes are matched first; everything else falls
//! through to the live routing snapshot.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware as axum_middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use plugdesk_core::PlugdeskError;
use plugdesk_plugin::PluginManager;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_admin, require_auth, SharedPolicy};
use crate::handlers;
use crate::render::PageRenderer;
use crate::routing::RoutingEngine;

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub routing: Arc<RoutingEngine>,
    pub policy: SharedPolicy,
    pub renderer: Arc<dyn PageRenderer>,
    /// Maximum accepted upload body in bytes.
    pub upload_limit: usize,
}

/// Listener configuration (mirrors `[server]` from plugdesk-config).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Assemble the full application router.
///
/// - GET /health (public)
/// - GET /plugins, GET /plugins/widgets, GET /plugins/menu,
///   GET /plugins/{name}/widgets/{id}, POST /plugins/{name}/call/{fn} (auth)
/// - POST /plugins/{name}/enable|disable, POST /plugins/upload,
///   GET|DELETE /plugins/logs (admin)
/// - anything else: dynamic routes
pub fn build_router(state: AppState) -> Router {
    let policy = state.policy.clone();

    let public_routes = Router::new().route("/health", get(handlers::get_health));

    let api_routes = Router::new()
        .route("/plugins", get(handlers::list_plugins))
        .route("/plugins/widgets", get(handlers::list_widgets))
        .route("/plugins/menu", get(handlers::get_menu))
        .route("/plugins/{name}/widgets/{id}", get(handlers::get_widget))
        .route("/plugins/{name}/call/{fn}", post(handlers::call_plugin))
        .route_layer(axum_middleware::from_fn_with_state(
            policy.clone(),
            require_auth,
        ));

    let admin_routes = Router::new()
        .route("/plugins/{name}/enable", post(handlers::enable_plugin))
        .route("/plugins/{name}/disable", post(handlers::disable_plugin))
        .route(
            "/plugins/upload",
            post(handlers::upload_plugin).layer(DefaultBodyLimit::max(state.upload_limit)),
        )
        .route(
            "/plugins/logs",
            get(handlers::get_logs).delete(handlers::clear_logs),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            policy.clone(),
            require_admin,
        ))
        .route_layer(axum_middleware::from_fn_with_state(policy, require_auth));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .merge(admin_routes)
        .fallback(serve_dynamic)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn serve_dynamic(State(state): State<AppState>, request: Request) -> Response {
    state.routing.serve(request).await
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn start_server(
    config: &ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), PlugdeskError> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        PlugdeskError::Config(format!("failed to bind gateway to {addr}: {e}"))
    })?;

    tracing::info!("Gateway server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| PlugdeskError::Internal(format!("gateway server error: {e}")))?;

    tracing::info!("Gateway server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_debug() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("127.0.0.1"));
    }
}
