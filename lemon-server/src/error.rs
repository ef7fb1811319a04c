//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Why a download stopped before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Paused,
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Paused => write!(f, "paused"),
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error kinds for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Backend {recipe}:{backend} is not supported on this host: {reason}")]
    UnsupportedBackend {
        recipe: String,
        backend: String,
        reason: String,
    },

    #[error("Failed to install {recipe}:{backend}: {cause}")]
    BackendInstallFailed {
        recipe: String,
        backend: String,
        cause: String,
    },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model invalidated by engine: {0}")]
    ModelInvalidated(String),

    #[error("Download aborted ({0})")]
    DownloadAborted(AbortReason),

    #[error("Engine {recipe}:{backend} did not become ready within {elapsed_ms} ms")]
    EngineNotReady {
        recipe: String,
        backend: String,
        elapsed_ms: u64,
    },

    #[error("{operation} is not supported by {engine}")]
    UnsupportedOperation { operation: String, engine: String },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Engine communication error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unsupported_operation(operation: &str, engine: &str) -> Self {
        Error::UnsupportedOperation {
            operation: operation.to_string(),
            engine: engine.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::UnsupportedBackend { .. } => (StatusCode::BAD_REQUEST, "unsupported_backend"),
            Error::BackendInstallFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "backend_install_failed")
            }
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::ModelInvalidated(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "model_invalidated")
            }
            Error::DownloadAborted(_) => (StatusCode::CONFLICT, "download_aborted"),
            Error::EngineNotReady { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "engine_not_ready"),
            Error::UnsupportedOperation { .. } => {
                (StatusCode::BAD_REQUEST, "unsupported_operation")
            }
            Error::Busy(_) => (StatusCode::CONFLICT, "busy"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::Transport(_) => (StatusCode::BAD_GATEWAY, "communication_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
