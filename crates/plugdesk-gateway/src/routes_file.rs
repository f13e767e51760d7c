// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Declarative routes configured outside of plugins.
//!
//! A route file is TOML with one `[[route]]` table per route:
//!
//! ```toml
//! [[route]]
//! method = "GET"
//! path = "/"
//! handler = "landing"        # or: redirect = "/tickets", or: html = "<p>..</p>"
//! middleware = ["auth"]
//! ```
//!
//! `handler` names are resolved against a [`HandlerRegistry`] when the
//! routing snapshot is built.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use futures::future::{BoxFuture, FutureExt};
use plugdesk_core::PlugdeskError;
use serde::{Deserialize, Serialize};

/// What a declarative route does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum RouteAction {
    /// Run a host handler registered under this name.
    Handler(String),
    /// Answer with `303 See Other` to this location.
    Redirect(String),
    /// Serve a fixed fragment inside the page shell.
    Html { title: String, body: String },
}

/// A route from a [`DeclarativeRouteSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRoute {
    pub method: String,
    pub path: String,
    pub middleware: Vec<String>,
    pub action: RouteAction,
}

/// Supplies the routes that precede plugin routes in every snapshot.
pub trait DeclarativeRouteSource: Send + Sync + 'static {
    /// Read the current route set. Called on every rebuild.
    fn routes(&self) -> Result<Vec<DeclaredRoute>, PlugdeskError>;
}

/// Fixed in-memory route list.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: Vec<DeclaredRoute>,
}

impl StaticRoutes {
    pub fn new(routes: Vec<DeclaredRoute>) -> Self {
        Self { routes }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl DeclarativeRouteSource for StaticRoutes {
    fn routes(&self) -> Result<Vec<DeclaredRoute>, PlugdeskError> {
        Ok(self.routes.clone())
    }
}

/// Route file read from disk on every rebuild.
#[derive(Debug, Clone)]
pub struct FileRouteSource {
    path: PathBuf,
}

impl FileRouteSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeclarativeRouteSource for FileRouteSource {
    fn routes(&self) -> Result<Vec<DeclaredRoute>, PlugdeskError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "route file absent");
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        parse_route_file(&content)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteFile {
    #[serde(default, rename = "route")]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteEntry {
    #[serde(default = "default_method")]
    method: String,
    path: String,
    #[serde(default)]
    middleware: Vec<String>,
    handler: Option<String>,
    redirect: Option<String>,
    html: Option<String>,
    #[serde(default)]
    title: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Parse the TOML route file format.
pub fn parse_route_file(content: &str) -> Result<Vec<DeclaredRoute>, PlugdeskError> {
    let file: RouteFile = toml::from_str(content)
        .map_err(|e| PlugdeskError::Validation(format!("invalid route file: {e}")))?;

    file.routes
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let action = match (entry.handler, entry.redirect, entry.html) {
                (Some(name), None, None) => RouteAction::Handler(name),
                (None, Some(location), None) => RouteAction::Redirect(location),
                (None, None, Some(body)) => RouteAction::Html {
                    title: entry.title,
                    body,
                },
                _ => {
                    return Err(PlugdeskError::Validation(format!(
                        "route #{} ({}): exactly one of `handler`, `redirect` or `html` is required",
                        i + 1,
                        entry.path
                    )));
                }
            };
            Ok(DeclaredRoute {
                method: entry.method.to_ascii_uppercase(),
                path: entry.path,
                middleware: entry.middleware,
                action,
            })
        })
        .collect()
}

/// Type-erased host handler.
pub type BoxedHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Named host handlers that declarative routes can point at.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |req| handler(req).boxed()));
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<BoxedHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn parses_all_actions() {
        let routes = parse_route_file(
            r#"
            [[route]]
            path = "/"
            handler = "landing"
            middleware = ["auth"]

            [[route]]
            method = "post"
            path = "/old"
            redirect = "/new"

            [[route]]
            path = "/about"
            html = "<p>About</p>"
            title = "About"
            "#,
        )
        .unwrap();

        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].method, "GET");
        assert_eq!(routes[0].action, RouteAction::Handler("landing".into()));
        assert_eq!(routes[0].middleware, vec!["auth"]);
        assert_eq!(routes[1].method, "POST");
        assert_eq!(routes[1].action, RouteAction::Redirect("/new".into()));
        assert_eq!(
            routes[2].action,
            RouteAction::Html {
                title: "About".into(),
                body: "<p>About</p>".into()
            }
        );
    }

    #[test]
    fn rejects_ambiguous_or_unknown_entries() {
        let ambiguous = "[[route]]\npath = \"/\"\nhandler = \"a\"\nredirect = \"/b\"\n";
        assert!(matches!(
            parse_route_file(ambiguous),
            Err(PlugdeskError::Validation(_))
        ));
        let unknown = "[[route]]\npath = \"/\"\nhandler = \"a\"\nverb = \"GET\"\n";
        assert!(parse_route_file(unknown).is_err());
    }

    #[test]
    fn missing_file_yields_no_routes() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileRouteSource::new(dir.path().join("routes.toml"));
        assert!(source.routes().unwrap().is_empty());

        std::fs::write(source.path(), "[[route]]\npath = \"/x\"\nredirect = \"/y\"\n").unwrap();
        assert_eq!(source.routes().unwrap().len(), 1);
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry =
            HandlerRegistry::new().with("ping", |_req: Request| async { "pong".into_response() });
        assert!(registry.get("ping").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["ping"]);
    }
}
