use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Idempotency conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flat error body returned on every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Error::Validation(detail) => {
                (StatusCode::BAD_REQUEST, "validation_error", detail.clone())
            }
            Error::Conflict(detail) => (StatusCode::CONFLICT, "conflict", detail.clone()),
            Error::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found", detail.clone()),
            Error::Auth => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid or missing API key".to_string(),
            ),
            Error::Storage(detail) => {
                tracing::error!("Storage error: {}", detail);
                crate::metrics::DB_FAILURES_TOTAL.inc();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    detail.clone(),
                )
            }
            Error::Database(e) => {
                tracing::error!("Database error: {}", e);
                crate::metrics::DB_FAILURES_TOTAL.inc();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "storage operation failed".to_string(),
                )
            }
            Error::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "internal serialization failure".to_string(),
                )
            }
        };

        (status, Json(ErrorBody { code, message })).into_response()
    }
}
