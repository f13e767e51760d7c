// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Translation of registry errors into HTTP responses.
//!
//! This is the only place a [`PlugdeskError`] becomes a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use plugdesk_core::PlugdeskError;
use serde::Serialize;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors returned by gateway handlers.
#[derive(Debug)]
pub enum ApiError {
    /// No valid credentials on the request.
    Unauthorized,
    /// Authenticated but not allowed.
    Forbidden(String),
    /// Malformed request the core never saw.
    BadRequest(String),
    Core(PlugdeskError),
}

impl From<PlugdeskError> for ApiError {
    fn from(e: PlugdeskError) -> Self {
        ApiError::Core(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                PlugdeskError::NotFound { .. } => StatusCode::NOT_FOUND,
                PlugdeskError::Disabled { .. } => StatusCode::FORBIDDEN,
                PlugdeskError::Validation(_) => StatusCode::BAD_REQUEST,
                PlugdeskError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                PlugdeskError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                PlugdeskError::Runtime { .. }
                | PlugdeskError::Load { .. }
                | PlugdeskError::Config(_)
                | PlugdeskError::Io(_)
                | PlugdeskError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message echoed to the client. Guest and host internals stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Unauthorized => "unauthorized".to_string(),
            ApiError::Forbidden(message) | ApiError::BadRequest(message) => message.clone(),
            ApiError::Core(e) => match e {
                PlugdeskError::Runtime { plugin, .. } => format!("plugin {plugin} failed"),
                PlugdeskError::Config(_) | PlugdeskError::Io(_) | PlugdeskError::Internal(_) => {
                    "internal error".to_string()
                }
                other => other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Core(PlugdeskError::Cancelled) => {
                tracing::debug!("request cancelled before the plugin returned");
            }
            ApiError::Core(e) if status.is_server_error() => {
                tracing::warn!(error = %e, status = status.as_u16(), "plugin request failed");
            }
            _ => {}
        }
        (
            status,
            Json(ErrorResponse {
                error: self.public_message(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        let cases = [
            (PlugdeskError::plugin_not_found("ghost"), StatusCode::NOT_FOUND),
            (
                PlugdeskError::Disabled { name: "p".into() },
                StatusCode::FORBIDDEN,
            ),
            (
                PlugdeskError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PlugdeskError::Timeout {
                    duration: Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (PlugdeskError::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (
                PlugdeskError::Load {
                    plugin: "p".into(),
                    message: "x".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn runtime_details_are_not_echoed() {
        let err = ApiError::from(PlugdeskError::Runtime {
            plugin: "billing".into(),
            message: "stack trace with secrets".into(),
        });
        let message = err.public_message();
        assert_eq!(message, "plugin billing failed");
    }

    #[test]
    fn not_found_mentions_the_name() {
        let err = ApiError::from(PlugdeskError::plugin_not_found("ghost"));
        assert!(err.public_message().contains("ghost"));
    }
}
