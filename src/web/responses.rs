//! HTTP error mapping.
//!
//! Handlers return `Result<_, AppError>`; this module maps the typed
//! sentinels onto status codes so callers see stable semantics.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::{AppError, SourceClientError};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation"),
            AppError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            AppError::SourceClient(SourceClientError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::Duplicate { .. } => (StatusCode::CONFLICT, "duplicate"),
            AppError::Transient { .. } => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            AppError::SourceClient(SourceClientError::Unavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {self}");
        }

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
