//! Error responses of the control surface.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use codescout_lsp::{CacheError, SessionError};
use codescout_types::wire::{ErrorBody, ErrorDetail};

/// A non-2xx answer with an `{error: {code, message}}` body.
#[derive(Debug, Clone, PartialEq, Eq)]
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

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.status.as_u16(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match &err {
            CacheError::UnknownEcosystem(_) | CacheError::UnmanagedFile(_) => {
                Self::bad_request(err.to_string())
            }
            _ if err.is_permanent() => Self::unavailable(err.to_string()),
            CacheError::Session {
                source: SessionError::LaunchCommandNotFound { .. },
                ..
            }
            | CacheError::WorkspaceUnreadable { .. } => {
                tracing::error!(error = %err, "Proxy misconfigured");
                Self::internal(err.to_string())
            }
            CacheError::Session { .. } | CacheError::ReconnectFailed { .. } => {
                Self::unavailable(err.to_string())
            }
        }
    }
}
