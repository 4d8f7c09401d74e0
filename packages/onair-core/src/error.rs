//! Centralized error types for the OnAir Tower core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Nothing in the audio path returns these to a caller; failures there
//! downgrade to a mode change plus a log entry. `TowerError` exists for
//! the API surface and for startup validation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the OnAir Tower server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TowerError {
    /// Configuration rejected at startup (zero capacity, bad argv, etc.).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The encoder child could not be spawned.
    #[error("Encoder spawn failed: {0}")]
    EncoderSpawn(String),

    /// The fallback loop asset could not be read or decoded.
    #[error("Fallback asset error: {0}")]
    FallbackAsset(String),

    /// PCM ingress is not available (status endpoint before wiring).
    #[error("PCM ingress not available: {0}")]
    IngressUnavailable(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TowerError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::EncoderSpawn(_) => "encoder_spawn_failed",
            Self::FallbackAsset(_) => "fallback_asset_error",
            Self::IngressUnavailable(_) => "ingress_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::IngressUnavailable(_) | Self::Configuration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type TowerResult<T> = Result<T, TowerError>;

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

impl From<std::io::Error> for TowerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_unavailable_maps_to_503() {
        let err = TowerError::IngressUnavailable("not wired".into());
        assert_eq!(err.code(), "ingress_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn configuration_error_maps_to_503() {
        let err = TowerError::Configuration("pcm_buffer_capacity must be >= 1".into());
        assert_eq!(err.code(), "configuration_error");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn invalid_request_maps_to_400() {
        let err = TowerError::InvalidRequest("bad path".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
