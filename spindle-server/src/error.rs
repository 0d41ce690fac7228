//! Thin `IntoResponse` shim over [`spindle_core::IngestError`] (spec.md §7:
//! "HTTP status 400 for invalid state transitions, 404 for missing
//! entities, 422 for schema violations").
//!
//! Grounded on the teacher's `ferrex-server/src/infra/errors.rs`: a
//! `{status, message}` struct with constructor helpers, `IntoResponse`
//! producing a `{"error": {"message", "status"}}` body, and `From` impls
//! that map domain/library errors without ever exposing raw internals
//! (sqlx errors in particular) to the client.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use spindle_core::IngestError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::NotFound(msg) => Self::not_found(msg),
            IngestError::ValidationError(msg) => Self::bad_request(msg),
            IngestError::Serialization(_) => Self::unprocessable(err.to_string()),
            IngestError::Database(inner) => {
                tracing::error!(error = ?inner, "database operation failed");
                Self::internal("database operation failed")
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::unprocessable(err.to_string())
    }
}
