// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP request handlers for the `/plugins` API.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Extension, Json};
use plugdesk_core::{LogLevel, PlugdeskError};
use plugdesk_plugin::{install_upload, LogEntry, LogQuery, MenuEntry, PluginManager, PluginStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::render::{widget_card, PageContext, PageRenderer};
use crate::routes_file::HandlerRegistry;
use crate::server::AppState;

/// Default number of entries returned by GET /plugins/logs.
const DEFAULT_LOG_LIMIT: usize = 100;

/// Response body for GET /health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Generation of the live routing snapshot.
    pub generation: u64,
    pub routes: usize,
}

/// Response body for GET /plugins.
#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginStatus>,
}

/// Widget metadata returned by GET /plugins/widgets.
#[derive(Debug, Serialize)]
pub struct WidgetInfo {
    pub id: String,
    pub title: String,
    pub plugin_name: String,
    pub size: String,
    pub location: String,
    pub refreshable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_sec: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct WidgetListResponse {
    pub widgets: Vec<WidgetInfo>,
}

/// Response body for POST /plugins/upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub name: String,
    pub path: String,
    pub runtime: String,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
    /// Entries in this response.
    pub count: usize,
    /// Entries held by the buffer.
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct MenuResponse {
    pub items: Vec<MenuEntry>,
    pub hidden: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocationQuery {
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WidgetQuery {
    #[serde(default)]
    pub wrap: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub plugin: Option<String>,
    pub level: Option<String>,
    pub limit: Option<usize>,
}

/// GET /health
pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.routing.snapshot();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        generation: snapshot.generation(),
        routes: snapshot.routes().len(),
    })
}

/// GET /plugins
///
/// Loaded and discovered plugins. Never triggers a load.
pub async fn list_plugins(State(state): State<AppState>) -> Json<PluginListResponse> {
    Json(PluginListResponse {
        plugins: state.manager.status(),
    })
}

/// POST /plugins/{name}/call/{fn}
///
/// The request body is forwarded verbatim; the result is returned as JSON.
pub async fn call_plugin(
    State(state): State<AppState>,
    Path((name, function)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let args: &[u8] = if body.is_empty() { b"{}" } else { &body };
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let result = state.manager.call(&cancel, &name, &function, args).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], result).into_response())
}

/// POST /plugins/{name}/enable
pub async fn enable_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Err(e) = state.manager.enable(&name).await {
        log_admin_failure(&state.manager, &name, "enable", &e);
        return Err(e.into());
    }
    state.routing.rebuild();
    Ok(Json(serde_json::json!({ "status": "enabled" })))
}

/// POST /plugins/{name}/disable
pub async fn disable_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Err(e) = state.manager.disable(&name) {
        log_admin_failure(&state.manager, &name, "disable", &e);
        return Err(e.into());
    }
    state.routing.rebuild();
    Ok(Json(serde_json::json!({ "status": "disabled" })))
}

fn log_admin_failure(manager: &PluginManager, name: &str, action: &str, e: &PlugdeskError) {
    // Unknown names have no buffer entry to attach to.
    if !matches!(e, PlugdeskError::NotFound { .. }) {
        manager
            .logs()
            .log(name, LogLevel::Error, format!("failed to {action} plugin: {e}"), None);
    }
}

/// GET /plugins/widgets?location=dashboard
///
/// Loads discovered plugins so their widgets are listed.
pub async fn list_widgets(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Json<WidgetListResponse> {
    let location = query.location.as_deref().unwrap_or("dashboard");
    let widgets = state
        .manager
        .all_widgets(location)
        .await
        .into_iter()
        .map(|entry| WidgetInfo {
            id: entry.widget.id,
            title: entry.widget.title,
            plugin_name: entry.plugin,
            size: entry.widget.size.to_string(),
            location: entry.widget.location,
            refreshable: entry.widget.refreshable,
            refresh_sec: (entry.widget.refresh_interval_seconds > 0)
                .then_some(entry.widget.refresh_interval_seconds),
        })
        .collect();
    Json(WidgetListResponse { widgets })
}

/// GET /plugins/{name}/widgets/{id}
///
/// Widget HTML; `?wrap=true` wraps it in a card.
pub async fn get_widget(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<WidgetQuery>,
    principal: Option<Extension<Principal>>,
) -> Result<Html<String>, ApiError> {
    let args = principal_args(principal.as_ref().map(|Extension(p)| p));
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let widget = state
        .manager
        .render_widget(&cancel, &name, &id, &args)
        .await?;
    if query.wrap {
        Ok(Html(widget_card(&widget.title, &widget.html)))
    } else {
        Ok(Html(widget.html))
    }
}

/// GET /plugins/menu?location=main
pub async fn get_menu(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Json<MenuResponse> {
    let location = query.location.as_deref().unwrap_or("main");
    Json(MenuResponse {
        items: state.manager.menu_items(location),
        hidden: state.manager.hidden_menu_items(),
        landing_page: state.manager.landing_page(),
    })
}

/// POST /plugins/upload
///
/// Installs the multipart `plugin` field, then loads it in the background.
pub async fn upload_plugin(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("plugin") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("plugin field has no filename".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
        upload = Some((filename, bytes));
        break;
    }
    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::BadRequest("missing multipart field `plugin`".to_string()))?;

    let plugin_dir = state.manager.plugin_dir().to_path_buf();
    let packaged = tokio::task::spawn_blocking(move || install_upload(&plugin_dir, &filename, &bytes))
        .await
        .map_err(|e| PlugdeskError::Internal(format!("upload task failed: {e}")))??;

    let needs_reload = state.manager.register_source(packaged.source());
    info!(plugin = %packaged.name, runtime = %packaged.runtime, reload = needs_reload, "plugin uploaded");

    let manager = Arc::clone(&state.manager);
    let routing = Arc::clone(&state.routing);
    let name = packaged.name.clone();
    tokio::spawn(async move {
        let result = if needs_reload {
            manager.reload(&name).await
        } else {
            manager.get(&name).await
        };
        match result {
            Ok(_) => {
                routing.rebuild();
                manager
                    .logs()
                    .log(&name, LogLevel::Info, "plugin activated after upload", None);
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "uploaded plugin failed to load");
                manager.logs().log(
                    &name,
                    LogLevel::Error,
                    format!("failed to load uploaded plugin: {e}"),
                    None,
                );
            }
        }
    });

    Ok((
        StatusCode::OK,
        Json(UploadResponse {
            message: "Plugin uploaded successfully".to_string(),
            name: packaged.name,
            path: packaged.binary_path.display().to_string(),
            runtime: packaged.runtime.to_string(),
        }),
    )
        .into_response())
}

/// GET /plugins/logs?plugin=&level=&limit=
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let level = match query.level.as_deref().filter(|l| !l.is_empty()) {
        Some(raw) => Some(
            raw.parse::<LogLevel>()
                .map_err(|_| ApiError::BadRequest(format!("unknown log level `{raw}`")))?,
        ),
        None => None,
    };
    let buffer = state.manager.logs();
    let logs = buffer.query(&LogQuery {
        plugin: query.plugin.filter(|p| !p.is_empty()),
        level,
        limit: Some(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
    });
    Ok(Json(LogsResponse {
        count: logs.len(),
        total: buffer.count(),
        logs,
    }))
}

/// DELETE /plugins/logs
pub async fn clear_logs(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.manager.logs().clear();
    Json(serde_json::json!({ "message": "Plugin logs cleared" }))
}

fn principal_args(principal: Option<&Principal>) -> Vec<u8> {
    let args = match principal {
        Some(p) => serde_json::json!({ "_user_id": p.user_id, "_is_admin": p.is_admin }),
        None => serde_json::json!({}),
    };
    args.to_string().into_bytes()
}

/// Host handlers available to declarative routes.
///
/// * `landing`: redirect to the landing page an enabled plugin claims, or
///   fall through to the dashboard.
/// * `dashboard`: every dashboard widget rendered as a card.
pub fn builtin_handlers(
    manager: Arc<PluginManager>,
    renderer: Arc<dyn PageRenderer>,
) -> HandlerRegistry {
    let landing_manager = Arc::clone(&manager);
    let landing_renderer = Arc::clone(&renderer);
    HandlerRegistry::new()
        .with("landing", move |request: Request| {
            let manager = Arc::clone(&landing_manager);
            let renderer = Arc::clone(&landing_renderer);
            async move {
                match manager.landing_page() {
                    Some(target) if target != request.uri().path() => {
                        Redirect::to(&target).into_response()
                    }
                    _ => dashboard_page(&manager, renderer.as_ref(), request).await,
                }
            }
        })
        .with("dashboard", move |request: Request| {
            let manager = Arc::clone(&manager);
            let renderer = Arc::clone(&renderer);
            async move { dashboard_page(&manager, renderer.as_ref(), request).await }
        })
}

async fn dashboard_page(
    manager: &PluginManager,
    renderer: &dyn PageRenderer,
    request: Request,
) -> Response {
    let principal = request.extensions().get::<Principal>().cloned();
    let args = principal_args(principal.as_ref());
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let body: String = manager
        .render_widgets(&cancel, "dashboard", &args)
        .await
        .iter()
        .map(|w| format!(r#"<section class="gk-card gk-card-{}">{}</section>"#, w.size, widget_card(&w.title, &w.html)))
        .collect();
    Html(renderer.render_page(&PageContext {
        title: "Dashboard",
        body_html: &body,
        active_page: "dashboard",
        user: principal.as_ref(),
    }))
    .into_response()
}
