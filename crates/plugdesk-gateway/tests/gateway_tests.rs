// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests of the HTTP surface over mock guests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use plugdesk_core::{LogLevel, PluginState};
use plugdesk_gateway::{
    build_router, builtin_handlers, AppState, PageRenderer, RoutingEngine, ShellRenderer,
    StaticRoutes, TokenAccessPolicy,
};
use plugdesk_plugin::{ManagerSettings, PluginManager};
use plugdesk_test_utils::archive::{zip_bytes, WASM_STUB};
use plugdesk_test_utils::{MockGuest, MockLoader};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const AGENT: &str = "agent-token";
const ADMIN: &str = "admin-token";

const DESK: &str = r#"{
    "name":"desk","version":"0.3.0",
    "routes":[{"method":"GET","path":"/desk/queue/:id","handler":"queue","middleware":["auth"]}],
    "widgets":[{"id":"open","title":"Open tickets","handler":"open_widget"}],
    "menu_items":[{"id":"desk","label":"Desk","path":"/desk/queue/1","order":2}],
    "hide_menu_items":["legacy-reports"]
}"#;

const REPORTS: &str = r#"{
    "name":"reports","version":"1.0.0",
    "routes":[{"method":"GET","path":"/reports/summary","handler":"summary"}]
}"#;

struct Harness {
    app: Router,
    manager: Arc<PluginManager>,
    routing: Arc<RoutingEngine>,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("desk.wasm"), WASM_STUB).unwrap();

    let loader = MockLoader::new()
        .with_plugin("desk", || {
            MockGuest::new(DESK)
                .with_echo("queue")
                .with_echo("echo")
                .with_response("open_widget", r#"{"html":"<b>7</b>"}"#)
        })
        .with_plugin("reports", || {
            MockGuest::new(REPORTS).with_response("summary", r#"{"total":42}"#)
        });
    let manager = Arc::new(PluginManager::new(
        Arc::new(loader),
        ManagerSettings::new(dir.path()),
    ));
    manager.discover_and_load_all().await.unwrap();

    let policy: plugdesk_gateway::SharedPolicy = Arc::new(
        TokenAccessPolicy::new()
            .with_token(AGENT, "agent-1", false)
            .with_token(ADMIN, "admin-1", true),
    );
    let renderer: Arc<dyn PageRenderer> = Arc::new(ShellRenderer::default());
    let routing = Arc::new(RoutingEngine::new(
        manager.clone(),
        Arc::new(StaticRoutes::empty()),
        builtin_handlers(manager.clone(), renderer.clone()),
        renderer.clone(),
        policy.clone(),
    ));
    routing.rebuild();

    let app = build_router(AppState {
        manager: manager.clone(),
        routing: routing.clone(),
        policy,
        renderer,
        upload_limit: 4 * 1024 * 1024,
    });
    Harness {
        app,
        manager,
        routing,
        _dir: dir,
    }
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn multipart_upload(filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "plugdesk-test-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"plugin\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/plugins/upload")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn health_is_public_and_reports_generation() {
    let h = harness().await;
    let (status, body) = send_json(&h.app, request("GET", "/health", None, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["generation"], h.routing.generation());
    assert_eq!(body["routes"], 1);
}

#[tokio::test]
async fn plugin_api_requires_a_token() {
    let h = harness().await;
    let (status, body) = send_json(&h.app, request("GET", "/plugins", None, Body::empty())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, body) =
        send_json(&h.app, request("GET", "/plugins", Some(AGENT), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let plugins = body["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["name"], "desk");
    assert_eq!(plugins[0]["loaded"], true);
    assert_eq!(plugins[0]["enabled"], true);
}

#[tokio::test]
async fn admin_endpoints_reject_agents() {
    let h = harness().await;
    let (status, _) = send(
        &h.app,
        request("POST", "/plugins/desk/disable", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.manager.is_enabled("desk"));
}

#[tokio::test]
async fn enabling_an_unknown_plugin_is_not_found() {
    let h = harness().await;
    let (status, body) = send_json(
        &h.app,
        request("POST", "/plugins/ghost/enable", Some(ADMIN), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn call_forwards_body_and_returns_raw_json() {
    let h = harness().await;
    let (status, body) = send_json(
        &h.app,
        request(
            "POST",
            "/plugins/desk/call/echo",
            Some(AGENT),
            Body::from(r#"{"ticket":12}"#),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ticket"], 12);
}

#[tokio::test]
async fn disabled_plugin_answers_forbidden_and_loses_its_routes() {
    let h = harness().await;
    let (status, _) =
        send(&h.app, request("GET", "/desk/queue/9", Some(AGENT), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(
        &h.app,
        request("POST", "/plugins/desk/disable", Some(ADMIN), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "disabled");

    let (status, _) = send(
        &h.app,
        request("POST", "/plugins/desk/call/echo", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) =
        send(&h.app, request("GET", "/desk/queue/9", Some(AGENT), Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(
        &h.app,
        request("POST", "/plugins/desk/enable", Some(ADMIN), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "enabled");
    assert!(h.routing.snapshot().contains("GET", "/desk/queue/{id}"));
}

#[tokio::test]
async fn plugin_routes_receive_path_params_and_principal() {
    let h = harness().await;
    let (status, body) = send_json(
        &h.app,
        request("GET", "/desk/queue/9?state=open", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "9");
    assert_eq!(body["state"], "open");
    assert_eq!(body["_user_id"], "agent-1");
    assert_eq!(body["_is_admin"], false);

    let (status, _) = send(&h.app, request("GET", "/desk/queue/9", None, Body::empty())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn widgets_are_listed_and_rendered() {
    let h = harness().await;
    let (status, body) = send_json(
        &h.app,
        request("GET", "/plugins/widgets", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["widgets"][0]["id"], "open");
    assert_eq!(body["widgets"][0]["plugin_name"], "desk");

    let (status, html) = send(
        &h.app,
        request("GET", "/plugins/desk/widgets/open", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(html, b"<b>7</b>");

    let (_, wrapped) = send(
        &h.app,
        request(
            "GET",
            "/plugins/desk/widgets/open?wrap=true",
            Some(AGENT),
            Body::empty(),
        ),
    )
    .await;
    let wrapped = String::from_utf8(wrapped).unwrap();
    assert!(wrapped.contains(r#"<h3 class="gk-card-title">Open tickets</h3>"#));

    let (status, _) = send(
        &h.app,
        request("GET", "/plugins/desk/widgets/closed", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn menu_reports_items_and_hidden_ids() {
    let h = harness().await;
    let (status, body) = send_json(
        &h.app,
        request("GET", "/plugins/menu", Some(AGENT), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["id"], "desk");
    assert_eq!(body["items"][0]["plugin"], "desk");
    assert_eq!(body["hidden"], serde_json::json!(["legacy-reports"]));
}

#[tokio::test]
async fn uploaded_bundle_goes_live() {
    let h = harness().await;
    let bundle = zip_bytes(&[
        (
            "plugin.toml",
            b"[plugin]\nname = \"reports\"\nversion = \"1.0.0\"\nwasm = \"reports.wasm\"\n",
        ),
        ("reports.wasm", WASM_STUB),
    ]);

    let (status, body) = send_json(&h.app, multipart_upload("reports.zip", &bundle)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "reports");
    assert_eq!(body["runtime"], "wasm");
    assert_eq!(body["message"], "Plugin uploaded successfully");

    let routing = h.routing.clone();
    let manager = h.manager.clone();
    eventually(|| {
        manager.state("reports") == Some(PluginState::Enabled)
            && routing.snapshot().contains("GET", "/reports/summary")
    })
    .await;

    let (status, body) =
        send_json(&h.app, request("GET", "/reports/summary", None, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 42);
}

#[tokio::test]
async fn upload_rejects_unknown_formats() {
    let h = harness().await;
    let (status, _) = send(&h.app, multipart_upload("notes.txt", b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!h.manager.known().contains(&"notes".to_string()));
}

#[tokio::test]
async fn logs_can_be_filtered_and_cleared() {
    let h = harness().await;
    let logs = h.manager.logs();
    logs.clear();
    logs.log("desk", LogLevel::Info, "queue refreshed", None);
    logs.log("desk", LogLevel::Error, "mailbox unreachable", None);
    logs.log("other", LogLevel::Error, "boom", None);

    let (status, body) = send_json(
        &h.app,
        request(
            "GET",
            "/plugins/logs?plugin=desk&level=warn",
            Some(ADMIN),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["total"], 3);
    assert_eq!(body["logs"][0]["message"], "mailbox unreachable");

    let (status, _) = send(
        &h.app,
        request("GET", "/plugins/logs?level=loud", Some(ADMIN), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(
        &h.app,
        request("DELETE", "/plugins/logs", Some(ADMIN), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Plugin logs cleared");
    assert_eq!(h.manager.logs().count(), 0);
}

#[tokio::test]
async fn unmatched_paths_fall_through_to_json_404() {
    let h = harness().await;
    let (status, body) =
        send_json(&h.app, request("GET", "/nowhere", None, Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("/nowhere"));
}
