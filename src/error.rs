//! Application error type and its HTTP mapping.

use std::fmt;
use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::merge::MergeError;
use crate::registry::RegistryError;

#[derive(Debug)]
pub enum AppError {
    /// Missing or malformed request input
    Validation(String),
    /// The concurrent-session cap is reached
    CapacityExceeded,
    /// Unknown stream identifier
    NotFound(String),
    /// Unknown, already consumed, or expired merge token
    InvalidMergeId,
    /// The external merge step exited nonzero
    MergeFailed(String),
    /// The external transcoder could not be started
    SpawnFailed(io::Error),
    /// Filesystem failure during session setup
    Internal(io::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "invalid request: {}", msg),
            AppError::CapacityExceeded => write!(f, "maximum concurrent streams reached"),
            AppError::NotFound(id) => write!(f, "stream not found: {}", id),
            AppError::InvalidMergeId => write!(f, "invalid merge id"),
            AppError::MergeFailed(msg) => write!(f, "merge failed: {}", msg),
            AppError::SpawnFailed(e) => write!(f, "failed to start transcoder: {}", e),
            AppError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::SpawnFailed(e) | AppError::Internal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded => AppError::CapacityExceeded,
            RegistryError::NotFound(id) => AppError::NotFound(id),
        }
    }
}

impl From<MergeError> for AppError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::InvalidMergeId => AppError::InvalidMergeId,
            MergeError::Failed(msg) => AppError::MergeFailed(msg),
            MergeError::Io(e) => AppError::Internal(e),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidMergeId => StatusCode::BAD_REQUEST,
            AppError::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MergeFailed(_) | AppError::SpawnFailed(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::Validation("name".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::CapacityExceeded.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::InvalidMergeId.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::MergeFailed("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn registry_errors_convert() {
        let err: AppError = RegistryError::CapacityExceeded.into();
        assert!(matches!(err, AppError::CapacityExceeded));
    }
}
