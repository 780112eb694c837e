//! Centralized error types for the Tower core library.
//!
//! Per the error handling design, almost all runtime faults recover locally
//! (discard-and-continue, restart-with-backoff, tier degradation) and never
//! become a surfaced `Result::Err`. The one exception is test-isolation
//! violations: starting the encoder supervisor without explicit permission
//! is a programmer error and must be raised, not swallowed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Tower server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TowerError {
    /// `EncoderSupervisor::start` was called without subprocess permission.
    ///
    /// This is the only error the supervisor ever surfaces: every other
    /// liveness fault is absorbed internally and drives a restart instead.
    #[error("subprocess launch not permitted: {0}")]
    SubprocessNotPermitted(String),

    /// Malformed `/control/source` request body.
    #[error("invalid source selection: {0}")]
    InvalidSourceSelection(String),

    /// Failed to bind the HTTP listener to its configured port.
    #[error("failed to bind: {0}")]
    Bind(String),

    /// Configuration error surfaced at startup (missing/invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ErrorCode for TowerError {
    fn code(&self) -> &'static str {
        match self {
            Self::SubprocessNotPermitted(_) => "subprocess_not_permitted",
            Self::InvalidSourceSelection(_) => "invalid_source_selection",
            Self::Bind(_) => "bind_failed",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl TowerError {
    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSourceSelection(_) => StatusCode::BAD_REQUEST,
            Self::SubprocessNotPermitted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Bind(_) | Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for TowerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Convenient Result alias for application-wide operations.
pub type TowerResult<T> = Result<T, TowerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_source_selection_is_bad_request() {
        let err = TowerError::InvalidSourceSelection("unknown tier".into());
        assert_eq!(err.code(), "invalid_source_selection");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn subprocess_not_permitted_is_internal_error() {
        let err = TowerError::SubprocessNotPermitted("allow_subprocess_in_tests is false".into());
        assert_eq!(err.code(), "subprocess_not_permitted");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
