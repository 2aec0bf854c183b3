//! Error types for the server.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reportbox_storage::StorageError;
use thiserror::Error;
use tracing::error;

use crate::export::ExportError;
use crate::gate::Denial;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// No valid session.
    #[error("Authentication required: {0}")]
    Authentication(String),

    /// Session lacks the required role or ownership.
    #[error("Forbidden: {0}")]
    Authorization(String),

    /// Bad request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload too large.
    #[error("Payload too large")]
    PayloadTooLarge,

    /// No response head within the configured request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "unauthenticated",
            Self::Authorization(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Header carrying [`AppError::error_code`] next to the plain-text reason.
pub const ERROR_CODE_HEADER: &str = "X-Error-Code";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.error_code(), "{self}");
        }

        (
            status,
            [(ERROR_CODE_HEADER, self.error_code())],
            self.to_string(),
        )
            .into_response()
    }
}

/// Result type for the server.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound { .. } => Self::NotFound(error.to_string()),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvalidPath(_) => Self::BadRequest(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<Denial> for AppError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::Unauthenticated => Self::Authentication("no valid session".to_string()),
            Denial::Forbidden(reason) => Self::Authorization(reason.to_string()),
        }
    }
}

impl From<ExportError> for AppError {
    fn from(error: ExportError) -> Self {
        match error {
            ExportError::InvalidRequest(msg) => Self::BadRequest(msg),
            ExportError::UnknownExport(id) => Self::NotFound(format!("export {id}")),
            ExportError::PurgeRefused(msg) => Self::Conflict(msg),
            ExportError::Store(e) => e.into(),
            ExportError::StreamAborted(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::Authentication("test".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(Denial::Forbidden("teachers only")).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(ExportError::InvalidRequest("empty".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(StorageError::Conflict("busy".into())).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::Authentication("test".into()).error_code(),
            "unauthenticated"
        );
        assert_eq!(AppError::NotFound("x".into()).error_code(), "not_found");
        assert_eq!(
            AppError::Timeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
