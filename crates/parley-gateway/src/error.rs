//! Mapping of session failures onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use parley_pipeline::{LifecycleError, SessionError};

/// An error response: status plus `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(session_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("unknown session '{session_id}'"))
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self.status {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::CONFLICT => "already_initialized",
            StatusCode::UNPROCESSABLE_ENTITY => "validation",
            StatusCode::BAD_GATEWAY => "transport",
            StatusCode::NOT_FOUND => "not_found",
            _ => "internal",
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Unauthorized => StatusCode::UNAUTHORIZED,
            SessionError::Lifecycle(LifecycleError::AlreadyInitialized(_)) => StatusCode::CONFLICT,
            SessionError::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
