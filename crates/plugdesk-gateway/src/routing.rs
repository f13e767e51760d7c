// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dynamic routing engine.
//!
//! A [`RoutingSnapshot`] is a fully built axum router holding the declarative
//! routes followed by the routes of every enabled plugin. Snapshots are
//! immutable; [`RoutingEngine::rebuild`] builds a fresh one and swaps it in
//! through an [`ArcSwap`]. Requests load the live snapshot once and keep it
//! for their whole lifetime, so a swap never disturbs in-flight requests.
//!
//! Every build draws a generation number. Publishing a snapshot older than
//! the live one is refused, so a slow rebuild cannot overwrite a newer one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use axum::extract::{FromRequestParts, Query, RawPathParams, Request};
use axum::http::{header, request::Parts, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use chrono::{DateTime, Utc};
use plugdesk_core::PlugdeskError;
use plugdesk_plugin::{PluginManager, RegistryEventKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::auth::{require_admin, require_auth, Principal, SharedPolicy};
use crate::error::ApiError;
use crate::render::{PageContext, PageRenderer};
use crate::routes_file::{DeclarativeRouteSource, DeclaredRoute, HandlerRegistry, RouteAction};

/// Largest request body forwarded to a plugin route.
const MAX_PLUGIN_BODY: usize = 8 * 1024 * 1024;

/// Argument keys with this prefix are set by the host only.
const RESERVED_PREFIX: char = '_';

/// Where a served route came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "lowercase")]
pub enum RouteOrigin {
    Declarative,
    Plugin { plugin: String },
}

/// One route contained in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    pub method: String,
    /// Path in `{param}` syntax.
    pub path: String,
    pub handler: String,
    pub middleware: Vec<String>,
    #[serde(flatten)]
    pub origin: RouteOrigin,
}

/// An immutable serving table.
pub struct RoutingSnapshot {
    generation: u64,
    built_at: DateTime<Utc>,
    routes: Vec<RouteDescriptor>,
    skipped: usize,
    router: Router,
}

impl RoutingSnapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            built_at: Utc::now(),
            routes: Vec::new(),
            skipped: 0,
            router: Router::new().fallback(route_not_found),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    /// Routes left out of this snapshot because they were invalid.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// True if the snapshot serves `method` on `path` (in `{param}` syntax).
    pub fn contains(&self, method: &str, path: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.method == method && r.path == path)
    }

    /// Serve a request from this snapshot.
    pub async fn serve(&self, request: Request) -> Response {
        match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

impl std::fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("generation", &self.generation)
            .field("routes", &self.routes.len())
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Owns the live routing snapshot and rebuilds it on demand.
pub struct RoutingEngine {
    manager: Arc<PluginManager>,
    declarative: Arc<dyn DeclarativeRouteSource>,
    handlers: HandlerRegistry,
    renderer: Arc<dyn PageRenderer>,
    policy: SharedPolicy,
    live: ArcSwap<RoutingSnapshot>,
    next_generation: AtomicU64,
    publish_lock: Mutex<()>,
}

impl RoutingEngine {
    pub fn new(
        manager: Arc<PluginManager>,
        declarative: Arc<dyn DeclarativeRouteSource>,
        handlers: HandlerRegistry,
        renderer: Arc<dyn PageRenderer>,
        policy: SharedPolicy,
    ) -> Self {
        Self {
            manager,
            declarative,
            handlers,
            renderer,
            policy,
            live: ArcSwap::from_pointee(RoutingSnapshot::empty()),
            next_generation: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
        }
    }

    /// The live snapshot.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.live.load_full()
    }

    /// Generation of the live snapshot. Zero before the first rebuild.
    pub fn generation(&self) -> u64 {
        self.live.load().generation
    }

    /// Build a new snapshot from current declarative and registry state.
    ///
    /// Invalid routes are skipped with a warning; building never fails.
    pub fn build_snapshot(&self) -> RoutingSnapshot {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut builder = SnapshotBuilder::new(self.policy.clone());

        match self.declarative.routes() {
            Ok(routes) => {
                for route in routes {
                    self.add_declared(&mut builder, route);
                }
            }
            Err(e) => warn!(error = %e, "declarative routes unavailable, serving plugin routes only"),
        }

        for plugin in self.manager.enabled_plugins() {
            let name = plugin.name().to_string();
            for spec in &plugin.manifest().routes {
                let manager = self.manager.clone();
                let renderer = self.renderer.clone();
                let plugin_name = name.clone();
                let handler = spec.handler.clone();
                builder.add(
                    &spec.method,
                    &spec.path,
                    &spec.middleware,
                    RouteOrigin::Plugin {
                        plugin: name.clone(),
                    },
                    &spec.handler,
                    move |filter| {
                        on(filter, move |request: Request| async move {
                            dispatch_plugin_route(&manager, renderer.as_ref(), &plugin_name, &handler, request)
                                .await
                        })
                    },
                );
            }
        }

        builder.finish(generation)
    }

    /// Make `snapshot` live unless a newer one already is.
    pub fn publish(&self, snapshot: RoutingSnapshot) -> bool {
        let _guard = self.publish_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.live.load().generation;
        if snapshot.generation <= current {
            debug!(
                stale = snapshot.generation,
                live = current,
                "discarding routing snapshot older than the live one"
            );
            return false;
        }
        info!(
            generation = snapshot.generation,
            routes = snapshot.routes.len(),
            skipped = snapshot.skipped,
            "routing table published"
        );
        self.live.store(Arc::new(snapshot));
        true
    }

    /// Build and publish. Returns the live generation afterwards.
    pub fn rebuild(&self) -> u64 {
        let snapshot = self.build_snapshot();
        self.publish(snapshot);
        self.generation()
    }

    /// Serve a request from the snapshot that is live when it arrives.
    pub async fn serve(&self, request: Request) -> Response {
        let snapshot = self.snapshot();
        snapshot.serve(request).await
    }

    /// Rebuild whenever the registry reports a change to visible routes.
    pub fn spawn_rebuild_listener(self: &Arc<Self>, shutdown: &CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let shutdown = shutdown.clone();
        let mut events = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) if event.kind == RegistryEventKind::Failed => {}
                        Ok(event) => {
                            debug!(plugin = %event.plugin, kind = ?event.kind, "registry change, rebuilding routes");
                            engine.rebuild();
                        }
                        Err(RecvError::Lagged(missed)) => {
                            debug!(missed, "registry events lagged, rebuilding routes");
                            engine.rebuild();
                        }
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    fn add_declared(&self, builder: &mut SnapshotBuilder, route: DeclaredRoute) {
        let renderer = self.renderer.clone();
        match route.action {
            RouteAction::Handler(name) => {
                let Some(handler) = self.handlers.get(&name) else {
                    warn!(path = %route.path, handler = %name, "skipping declarative route with unknown handler");
                    builder.skipped += 1;
                    return;
                };
                builder.add(
                    &route.method,
                    &route.path,
                    &route.middleware,
                    RouteOrigin::Declarative,
                    &name,
                    move |filter| on(filter, move |request: Request| handler(request)),
                );
            }
            RouteAction::Redirect(location) => {
                let label = format!("redirect:{location}");
                builder.add(
                    &route.method,
                    &route.path,
                    &route.middleware,
                    RouteOrigin::Declarative,
                    &label,
                    move |filter| on(filter, move || async move { Redirect::to(&location) }),
                );
            }
            RouteAction::Html { title, body } => {
                builder.add(
                    &route.method,
                    &route.path,
                    &route.middleware,
                    RouteOrigin::Declarative,
                    "html",
                    move |filter| {
                        on(filter, move |request: Request| async move {
                            let principal = request.extensions().get::<Principal>();
                            Html(renderer.render_page(&PageContext {
                                title: &title,
                                body_html: &body,
                                active_page: "page",
                                user: principal,
                            }))
                        })
                    },
                );
            }
        }
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("generation", &self.generation())
            .field("handlers", &self.handlers)
            .finish()
    }
}

async fn route_not_found(uri: Uri) -> ApiError {
    ApiError::Core(PlugdeskError::NotFound {
        kind: "route".to_string(),
        name: uri.path().to_string(),
    })
}

/// Accumulates validated routes for one snapshot.
struct SnapshotBuilder {
    policy: SharedPolicy,
    shapes: Vec<(String, Vec<Segment>)>,
    seen: HashSet<(String, String)>,
    paths: HashMap<String, MethodRouter>,
    routes: Vec<RouteDescriptor>,
    skipped: usize,
}

impl SnapshotBuilder {
    fn new(policy: SharedPolicy) -> Self {
        Self {
            policy,
            shapes: Vec::new(),
            seen: HashSet::new(),
            paths: HashMap::new(),
            routes: Vec::new(),
            skipped: 0,
        }
    }

    fn add(
        &mut self,
        method: &str,
        raw_path: &str,
        middleware: &[String],
        origin: RouteOrigin,
        handler: &str,
        make: impl FnOnce(MethodFilter) -> MethodRouter,
    ) -> bool {
        let method = method.to_ascii_uppercase();
        let Some(filter) = method_filter(&method) else {
            return self.skip(&method, raw_path, &origin, "unsupported method");
        };
        let (path, segments) = match normalize_path(raw_path) {
            Ok(normalized) => normalized,
            Err(reason) => return self.skip(&method, raw_path, &origin, &reason),
        };
        if self.seen.contains(&(method.clone(), path.clone())) {
            return self.skip(&method, &path, &origin, "duplicate method and path");
        }
        if let Some((other, _)) = self
            .shapes
            .iter()
            .find(|(other, shape)| *other != path && conflicts(shape, &segments))
        {
            let reason = format!("conflicts with {other}");
            return self.skip(&method, &path, &origin, &reason);
        }

        let mut needs_auth = false;
        let mut needs_admin = false;
        for name in middleware {
            match name.as_str() {
                "auth" => needs_auth = true,
                "admin" => {
                    needs_auth = true;
                    needs_admin = true;
                }
                other => {
                    let reason = format!("unknown middleware `{other}`");
                    return self.skip(&method, &path, &origin, &reason);
                }
            }
        }

        let mut method_router = make(filter);
        if needs_admin {
            method_router =
                method_router.layer(from_fn_with_state(self.policy.clone(), require_admin));
        }
        if needs_auth {
            method_router =
                method_router.layer(from_fn_with_state(self.policy.clone(), require_auth));
        }

        let merged = match self.paths.remove(&path) {
            Some(existing) => existing.merge(method_router),
            None => {
                self.shapes.push((path.clone(), segments));
                method_router
            }
        };
        self.paths.insert(path.clone(), merged);
        self.seen.insert((method.clone(), path.clone()));
        self.routes.push(RouteDescriptor {
            method,
            path,
            handler: handler.to_string(),
            middleware: middleware.to_vec(),
            origin,
        });
        true
    }

    fn skip(&mut self, method: &str, path: &str, origin: &RouteOrigin, reason: &str) -> bool {
        match origin {
            RouteOrigin::Plugin { plugin } => {
                warn!(plugin = %plugin, method, path, reason, "skipping plugin route")
            }
            RouteOrigin::Declarative => warn!(method, path, reason, "skipping declarative route"),
        }
        self.skipped += 1;
        false
    }

    fn finish(self, generation: u64) -> RoutingSnapshot {
        let router = self
            .paths
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            })
            .fallback(route_not_found);
        RoutingSnapshot {
            generation,
            built_at: Utc::now(),
            routes: self.routes,
            skipped: self.skipped,
            router,
        }
    }
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    Some(match method {
        "GET" => MethodFilter::GET,
        "POST" => MethodFilter::POST,
        "PUT" => MethodFilter::PUT,
        "PATCH" => MethodFilter::PATCH,
        "DELETE" => MethodFilter::DELETE,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
    CatchAll(String),
}

/// Accept `:param`/`*rest` and `{param}`/`{*rest}`; emit the brace form.
fn normalize_path(raw: &str) -> Result<(String, Vec<Segment>), String> {
    let Some(rest) = raw.strip_prefix('/') else {
        return Err("path must start with `/`".to_string());
    };
    let parts: Vec<&str> = rest.split('/').collect();
    let mut segments = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        let last = i + 1 == parts.len();
        let segment = if let Some(name) = part.strip_prefix(':') {
            Segment::Param(name.to_string())
        } else if let Some(name) = part.strip_prefix('*') {
            Segment::CatchAll(name.to_string())
        } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            match inner.strip_prefix('*') {
                Some(name) => Segment::CatchAll(name.to_string()),
                None => Segment::Param(inner.to_string()),
            }
        } else if part.contains(['{', '}', '*']) {
            return Err(format!("malformed segment `{part}`"));
        } else if part.is_empty() && !last {
            return Err("empty path segment".to_string());
        } else {
            Segment::Static(part.to_string())
        };

        match &segment {
            Segment::Param(name) | Segment::CatchAll(name)
                if name.is_empty()
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                return Err(format!("invalid parameter name in `{part}`"));
            }
            Segment::CatchAll(_) if !last => {
                return Err("catch-all must be the last segment".to_string());
            }
            _ => {}
        }
        segments.push(segment);
    }

    let path = segments
        .iter()
        .map(|s| match s {
            Segment::Static(s) => s.clone(),
            Segment::Param(name) => format!("{{{name}}}"),
            Segment::CatchAll(name) => format!("{{*{name}}}"),
        })
        .collect::<Vec<_>>()
        .join("/");
    Ok((format!("/{path}"), segments))
}

/// Whether two distinct paths would clash in the router's prefix tree.
fn conflicts(a: &[Segment], b: &[Segment]) -> bool {
    for (x, y) in a.iter().zip(b) {
        match (x, y) {
            (Segment::Static(x), Segment::Static(y)) if x == y => continue,
            (Segment::Param(x), Segment::Param(y)) if x == y => continue,
            (Segment::Static(_), _) | (_, Segment::Static(_)) => return false,
            _ => return true,
        }
    }
    false
}

async fn dispatch_plugin_route(
    manager: &PluginManager,
    renderer: &dyn PageRenderer,
    plugin: &str,
    handler: &str,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let principal = parts.extensions.get::<Principal>().cloned();
    let args = match plugin_args(&mut parts, body, principal.as_ref()).await {
        Ok(args) => args,
        Err(e) => return e.into_response(),
    };

    let cancel = CancellationToken::new();
    // Client disconnect drops this future and with it the guard.
    let _disconnect = cancel.clone().drop_guard();
    match manager.call(&cancel, plugin, handler, &args).await {
        Ok(bytes) => plugin_response(renderer, principal.as_ref(), bytes),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Merge path params, query, JSON body, request metadata, and the principal.
///
/// Client-supplied keys starting with `_` are dropped so a request cannot
/// pose as another user or as an admin.
async fn plugin_args(
    parts: &mut Parts,
    body: axum::body::Body,
    principal: Option<&Principal>,
) -> Result<Vec<u8>, ApiError> {
    let mut args = Map::new();

    let params = RawPathParams::from_request_parts(parts, &())
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
    for (key, value) in &params {
        args.insert(key.to_string(), Value::String(value.to_string()));
    }

    let Query(query) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in query {
        if key.starts_with(RESERVED_PREFIX) {
            continue;
        }
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => grouped.push((key, vec![value])),
        }
    }
    for (key, mut values) in grouped {
        let value = if values.len() == 1 {
            Value::String(values.remove(0))
        } else {
            Value::Array(values.into_iter().map(Value::String).collect())
        };
        args.insert(key, value);
    }

    let bytes = axum::body::to_bytes(body, MAX_PLUGIN_BODY)
        .await
        .map_err(|_| ApiError::BadRequest("request body too large".to_string()))?;
    if !bytes.is_empty()
        && let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(&bytes)
    {
        args.extend(
            fields
                .into_iter()
                .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX)),
        );
    }

    args.insert("_method".into(), Value::String(parts.method.to_string()));
    args.insert("_path".into(), Value::String(parts.uri.path().to_string()));
    if let Some(principal) = principal {
        args.insert("_user_id".into(), Value::String(principal.user_id.clone()));
        args.insert("_is_admin".into(), Value::Bool(principal.is_admin));
    }

    serde_json::to_vec(&Value::Object(args)).map_err(|e| ApiError::Core(PlugdeskError::Internal(e.to_string())))
}

/// `{"html": ...}` results become pages; anything else is returned as JSON.
fn plugin_response(renderer: &dyn PageRenderer, principal: Option<&Principal>, bytes: Vec<u8>) -> Response {
    if let Ok(Value::Object(result)) = serde_json::from_slice::<Value>(&bytes)
        && let Some(Value::String(html)) = result.get("html")
    {
        if result.get("raw").and_then(Value::as_bool) == Some(true) {
            return Html(html.clone()).into_response();
        }
        let page = renderer.render_page(&PageContext {
            title: result.get("title").and_then(Value::as_str).unwrap_or(""),
            body_html: html,
            active_page: result
                .get("active_page")
                .and_then(Value::as_str)
                .unwrap_or("plugin"),
            user: principal,
        });
        return Html(page).into_response();
    }
    ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAccessPolicy;
    use crate::render::ShellRenderer;
    use crate::routes_file::StaticRoutes;
    use axum::body::Body;
    use axum::http::StatusCode;
    use plugdesk_core::{PluginSource, RuntimeKind};
    use plugdesk_plugin::ManagerSettings;
    use plugdesk_test_utils::{MockGuest, MockLoader};

    const HELLO: &str = r#"{
        "name":"hello","version":"1.0.0",
        "routes":[
            {"method":"GET","path":"/hello/:who","handler":"greet"},
            {"method":"GET","path":"/hello/page","handler":"page"},
            {"method":"GET","path":"/hello/slow","handler":"slow"},
            {"method":"POST","path":"/hello/{who}","handler":"greet","middleware":["admin"]},
            {"method":"GET","path":"/secret","handler":"greet","middleware":["sudo"]},
            {"method":"GET","path":"/hello/{name}/x","handler":"greet"},
            {"method":"GET","path":"/about","handler":"greet"}
        ]
    }"#;

    fn hello_guest() -> MockGuest {
        MockGuest::new(HELLO)
            .with_echo("greet")
            .with_response("page", br#"{"html":"<p>hi</p>","title":"Greeting"}"#)
            .with_echo("slow")
            .with_delay("slow", std::time::Duration::from_secs(2))
    }

    async fn engine(routes: Vec<DeclaredRoute>) -> (Arc<RoutingEngine>, Arc<PluginManager>) {
        engine_with(hello_guest(), routes).await
    }

    async fn engine_with(
        guest: MockGuest,
        routes: Vec<DeclaredRoute>,
    ) -> (Arc<RoutingEngine>, Arc<PluginManager>) {
        let dir = std::env::temp_dir().join("plugdesk-routing-tests");
        let loader = MockLoader::new().with_instance("hello", guest);
        let manager = Arc::new(PluginManager::new(
            Arc::new(loader),
            ManagerSettings::new(&dir),
        ));
        manager.register_source(PluginSource {
            name: "hello".into(),
            runtime: RuntimeKind::Wasm,
            binary_path: dir.join("hello.wasm"),
            root: dir.clone(),
        });
        manager.get("hello").await.unwrap();
        let policy = TokenAccessPolicy::new()
            .with_token("agent", "agent-1", false)
            .with_token("root", "root-1", true);
        let engine = Arc::new(RoutingEngine::new(
            manager.clone(),
            Arc::new(StaticRoutes::new(routes)),
            HandlerRegistry::new(),
            Arc::new(ShellRenderer::default()),
            Arc::new(policy),
        ));
        (engine, manager)
    }

    fn get(uri: &str) -> Request {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn normalizes_both_param_syntaxes() {
        assert_eq!(normalize_path("/t/:id").unwrap().0, "/t/{id}");
        assert_eq!(normalize_path("/t/{id}").unwrap().0, "/t/{id}");
        assert_eq!(normalize_path("/files/*rest").unwrap().0, "/files/{*rest}");
        assert_eq!(normalize_path("/").unwrap().0, "/");
        assert!(normalize_path("relative").is_err());
        assert!(normalize_path("/a/{*rest}/b").is_err());
        assert!(normalize_path("/a/{bad").is_err());
        assert!(normalize_path("/a//b").is_err());
        assert!(normalize_path("/a/:").is_err());
    }

    #[test]
    fn detects_conflicting_shapes() {
        let shape = |p: &str| normalize_path(p).unwrap().1;
        assert!(conflicts(&shape("/t/{id}"), &shape("/t/{tid}")));
        assert!(conflicts(&shape("/t/{id}"), &shape("/t/{*rest}")));
        assert!(!conflicts(&shape("/t/{id}"), &shape("/t/new")));
        assert!(!conflicts(&shape("/a/{id}"), &shape("/b/{other}")));
        assert!(!conflicts(&shape("/t/{id}/x"), &shape("/t/{id}/y")));
    }

    #[tokio::test]
    async fn builds_valid_routes_and_skips_the_rest() {
        let (engine, _) = engine(vec![DeclaredRoute {
            method: "GET".into(),
            path: "/about".into(),
            middleware: vec![],
            action: RouteAction::Redirect("/".into()),
        }])
        .await;
        let snapshot = engine.build_snapshot();

        assert!(snapshot.contains("GET", "/hello/{who}"));
        assert!(snapshot.contains("POST", "/hello/{who}"));
        assert!(snapshot.contains("GET", "/hello/page"));
        // Unknown middleware, param-name conflict, and the duplicate /about.
        assert!(!snapshot.contains("GET", "/secret"));
        assert!(!snapshot.contains("GET", "/hello/{name}/x"));
        assert_eq!(snapshot.skipped(), 3);
        let about = snapshot.routes().iter().find(|r| r.path == "/about").unwrap();
        assert_eq!(about.origin, RouteOrigin::Declarative);
    }

    #[tokio::test]
    async fn dispatches_with_merged_args() {
        let (engine, _) = engine(vec![]).await;
        engine.rebuild();

        let response = engine.serve(get("/hello/world?lang=en&tag=a&tag=b")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let args = body_json(response).await;
        assert_eq!(args["who"], "world");
        assert_eq!(args["lang"], "en");
        assert_eq!(args["tag"], serde_json::json!(["a", "b"]));
        assert_eq!(args["_method"], "GET");
        assert_eq!(args["_path"], "/hello/world");
    }

    #[tokio::test]
    async fn clients_cannot_supply_reserved_keys() {
        let (engine, _) = engine(vec![]).await;
        engine.rebuild();

        let request = axum::http::Request::builder()
            .uri("/hello/world?_user_id=root&_path=/admin&lang=en")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"_is_admin":true,"_method":"DELETE","note":"hi"}"#))
            .unwrap();
        let response = engine.serve(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let args = body_json(response).await;
        assert_eq!(args["lang"], "en");
        assert_eq!(args["note"], "hi");
        assert_eq!(args["_method"], "GET");
        assert_eq!(args["_path"], "/hello/world");
        assert!(args.get("_user_id").is_none());
        assert!(args.get("_is_admin").is_none());
    }

    #[tokio::test]
    async fn html_results_are_wrapped_in_the_shell() {
        let (engine, _) = engine(vec![]).await;
        engine.rebuild();

        let response = engine.serve(get("/hello/page")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("<title>Greeting - Plugdesk</title>"));
        assert!(page.contains("<p>hi</p>"));
    }

    #[tokio::test]
    async fn admin_middleware_is_enforced() {
        let (engine, _) = engine(vec![]).await;
        engine.rebuild();

        let post = |token: Option<&str>| {
            let mut builder = axum::http::Request::builder().method("POST").uri("/hello/x");
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            builder.body(Body::from("{}")).unwrap()
        };
        assert_eq!(engine.serve(post(None)).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(engine.serve(post(Some("agent"))).await.status(), StatusCode::FORBIDDEN);

        let response = engine.serve(post(Some("root"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let args = body_json(response).await;
        assert_eq!(args["_user_id"], "root-1");
        assert_eq!(args["_is_admin"], true);
    }

    #[tokio::test]
    async fn captured_snapshot_survives_a_rebuild() {
        let (engine, manager) = engine(vec![]).await;
        engine.rebuild();
        let before = engine.snapshot();

        manager.disable("hello").unwrap();
        engine.rebuild();
        let after = engine.snapshot();

        assert!(before.contains("GET", "/hello/{who}"));
        assert!(!after.contains("GET", "/hello/{who}"));
        assert!(after.generation() > before.generation());
        assert_eq!(
            engine.serve(get("/hello/world")).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_request_completes_across_a_publish() {
        let guest = hello_guest();
        let (engine, manager) = engine_with(guest.clone(), vec![]).await;
        engine.rebuild();

        let in_flight = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.serve(get("/hello/slow")).await.status() }
        });
        while guest.call_count("slow") == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        manager.disable("hello").unwrap();
        engine.rebuild();
        assert_eq!(
            engine.serve(get("/hello/slow")).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(in_flight.await.unwrap(), StatusCode::OK);
    }

    #[tokio::test]
    async fn older_snapshot_never_replaces_newer() {
        let (engine, _) = engine(vec![]).await;
        let first = engine.build_snapshot();
        let second = engine.build_snapshot();
        assert!(engine.publish(second));
        assert!(!engine.publish(first));
        assert_eq!(engine.generation(), 2);
    }

    #[tokio::test]
    async fn registry_events_trigger_rebuilds() {
        let (engine, manager) = engine(vec![]).await;
        let shutdown = CancellationToken::new();
        let listener = engine.spawn_rebuild_listener(&shutdown);

        manager.disable("hello").unwrap();
        for _ in 0..100 {
            if engine.generation() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(engine.generation() > 0);
        assert!(!engine.snapshot().contains("GET", "/hello/{who}"));

        shutdown.cancel();
        listener.await.unwrap();
    }
}
