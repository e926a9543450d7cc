//! Typed HTTP error kinds and their wire shape.
//!
//! Validation errors surface with per-field detail; engine failures during
//! background execution never reach this type (they become the session's
//! `error_summary` instead). Only programming errors map to 500.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::core::policy::FieldError;
use crate::core::types::SessionStatus;

#[derive(Debug)]
pub enum ApiError {
    /// Missing or wrong Bearer token.
    Unauthorized,
    /// Policy or prompt validation rejected the request body.
    InvalidInput(Vec<FieldError>),
    /// Path guard rejected an excerpt target.
    PathDenied(String),
    /// The gate is held by another session.
    Busy { active_session: Option<String> },
    NotFound,
    /// Abort against a session that is not running.
    Conflict { status: SessionStatus },
    Internal(anyhow::Error),
}

impl ApiError {
    /// Wrap a single-field validation failure.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        ApiError::InvalidInput(vec![FieldError {
            field: field.to_string(),
            message: message.into(),
        }])
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            ApiError::InvalidInput(fields) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid input", "fields": fields})),
            )
                .into_response(),
            ApiError::PathDenied(reason) => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "path denied", "reason": reason})),
            )
                .into_response(),
            ApiError::Busy { active_session } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "another session is active",
                    "active_session": active_session,
                })),
            )
                .into_response(),
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
            }
            ApiError::Conflict { status } => (
                StatusCode::CONFLICT,
                Json(json!({"status": status})),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}
