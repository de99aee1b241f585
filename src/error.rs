//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache crate.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A caller-supplied argument failed validation (empty key,
    /// non-positive duration, negative size, out-of-range fraction).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The cache has been shut down; no operation succeeds afterwards.
    #[error("Cache has been disposed")]
    Disposed,

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Backing store I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CacheError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CacheError::Disposed => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            CacheError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CacheError::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            CacheError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache crate.
pub type Result<T> = std::result::Result<T, CacheError>;
