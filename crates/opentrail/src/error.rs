use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Raised while parsing a raw line into a [`crate::model::LogEntry`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,

    #[error("malformed priority: {0}")]
    MalformedPriority(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("bad template format: {0}")]
    BadFormat(String),
}

/// Raised by the storage engine. `QueueFull` and `NotRunning` are the two
/// callers are expected to branch on; everything else is reported as-is.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("write queue is full")]
    QueueFull,

    #[error("storage is not running")]
    NotRunning,

    #[error("entry conversion failed: {0}")]
    Conversion(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(String),
}

/// Raised by the log service pipeline.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("log queue is full")]
    QueueFull,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configuration validation failure. Fatal at startup.
#[derive(Debug, Error)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// HTTP-facing errors. Internal detail is logged server-side and never
/// included in the response body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("internal error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => {
                let body = Json(json!({ "success": false, "error": "unauthorized" }));
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Basic realm=\"opentrail\"")],
                    body,
                )
                    .into_response();
            }
            ApiError::Internal(detail) => {
                tracing::error!("internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
