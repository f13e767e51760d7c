// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authentication and admin gating.
//!
//! Requests carry `Authorization: Bearer <token>`. The [`AccessPolicy`]
//! resolves the token to a [`Principal`], which the middleware stores in the
//! request extensions for handlers and plugin argument building. With no
//! tokens configured every protected request is rejected (fail-closed).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub is_admin: bool,
}

/// Decides who a request is and what they may do.
pub trait AccessPolicy: Send + Sync + 'static {
    /// Resolve the caller, or `None` if the request is not authenticated.
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;

    fn is_admin(&self, principal: &Principal) -> bool {
        principal.is_admin
    }
}

/// Shared policy handle used as middleware state.
pub type SharedPolicy = Arc<dyn AccessPolicy>;

/// Static bearer-token table.
#[derive(Clone, Default)]
pub struct TokenAccessPolicy {
    tokens: HashMap<String, Principal>,
}

impl TokenAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>, admin: bool) -> Self {
        self.tokens.insert(
            token.into(),
            Principal {
                user_id: user_id.into(),
                is_admin: admin,
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Debug for TokenAccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users: Vec<_> = self.tokens.values().map(|p| p.user_id.as_str()).collect();
        f.debug_struct("TokenAccessPolicy")
            .field("tokens", &"[redacted]")
            .field("users", &users)
            .finish()
    }
}

impl AccessPolicy for TokenAccessPolicy {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        if self.tokens.is_empty() {
            tracing::error!("no API tokens configured -- rejecting request");
            return None;
        }
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))?;
        self.tokens.get(token.trim()).cloned()
    }
}

/// Middleware requiring an authenticated principal.
pub async fn require_auth(
    State(policy): State<SharedPolicy>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = policy
        .authenticate(request.headers())
        .ok_or(ApiError::Unauthorized)?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Middleware requiring an admin principal. Runs after [`require_auth`].
pub async fn require_admin(
    State(policy): State<SharedPolicy>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = request
        .extensions()
        .get::<Principal>()
        .ok_or(ApiError::Unauthorized)?;
    if !policy.is_admin(principal) {
        tracing::debug!(user = %principal.user_id, path = %request.uri().path(), "admin required");
        return Err(ApiError::Forbidden("admin privileges required".to_string()));
    }
    Ok(next.run(request).await)
}
