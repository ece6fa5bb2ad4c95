//! Runtime error taxonomy and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::types::TradeSide;

/// Errors surfaced by the runtime cycles, the trade pipeline and the HTTP surface
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Missing or invalid credentials; the feature is disabled, not broken
    #[error("{0} is not configured")]
    ProviderUnavailable(&'static str),

    #[error("Open {side} order for {symbol} already pending ({remaining} shares unfilled)")]
    Conflict {
        symbol: String,
        side: TradeSide,
        remaining: u64,
    },

    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Runtime state actor has shut down")]
    StateClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for RuntimeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RuntimeError::Provider(format!("request timed out: {}", e))
        } else if e.is_decode() {
            RuntimeError::MalformedResponse(e.to_string())
        } else {
            RuntimeError::Provider(e.to_string())
        }
    }
}

impl RuntimeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RuntimeError::Conflict { .. } => StatusCode::CONFLICT,
            RuntimeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RuntimeError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Provider(_) | RuntimeError::MalformedResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            RuntimeError::StateClosed | RuntimeError::Io(_) | RuntimeError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
