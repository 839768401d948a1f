//! API error types.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reframe_media::{tail_chars, MediaError};
use reframe_models::ErrorResponse;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::is_production_environment;

/// Longest engine stderr excerpt returned to clients.
pub const STDERR_DETAIL_CHARS: usize = 800;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Provide either a url field or a file field")]
    MissingInput,

    #[error("Provide only one of url or file")]
    AmbiguousInput,

    #[error("Malformed request body: {0}")]
    BadRequestBody(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0}")]
    FetchFailed(String),

    /// Engine failure; carries the stderr excerpt when one was captured
    #[error("{message}")]
    ConvertFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("{0}")]
    StorageFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_body(msg: impl Into<String>) -> Self {
        Self::BadRequestBody(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable code placed in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MissingInput => "missing_input",
            ApiError::AmbiguousInput => "ambiguous_input",
            ApiError::BadRequestBody(_) => "bad_request_body",
            ApiError::InvalidParameter(_) => "invalid_parameter",
            ApiError::FetchFailed(_) => "fetch_failed",
            ApiError::ConvertFailed { .. } => "convert_failed",
            ApiError::StorageFailed(_) => "storage_failed",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingInput
            | ApiError::AmbiguousInput
            | ApiError::BadRequestBody(_)
            | ApiError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::FetchFailed(_) | ApiError::ConvertFailed { .. } | ApiError::StorageFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::ConvertFailed { message, stderr } => match stderr {
                Some(stderr) if !stderr.trim().is_empty() => {
                    tail_chars(stderr.trim_end(), STDERR_DETAIL_CHARS)
                }
                _ => message.clone(),
            },
            // Don't expose internal error details in production
            ApiError::Internal(_) => {
                if is_production_environment(&std::env::var("ENVIRONMENT").unwrap_or_default()) {
                    "An internal error occurred".to_string()
                } else {
                    self.to_string()
                }
            }
            _ => self.to_string(),
        }
    }
}

impl From<MediaError> for ApiError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Fetch(fetch) => ApiError::FetchFailed(fetch.to_string()),
            MediaError::InvalidInput(msg) => ApiError::InvalidParameter(msg),
            MediaError::FfmpegFailed { .. }
            | MediaError::EmptyOutput
            | MediaError::EngineExhausted { .. }
            | MediaError::Timeout(_) => {
                let stderr = e.stderr().map(str::to_string);
                ApiError::ConvertFailed {
                    message: e.to_string(),
                    stderr,
                }
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<reframe_storage::StorageError> for ApiError {
    fn from(e: reframe_storage::StorageError) -> Self {
        ApiError::StorageFailed(e.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequestBody(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), "{}", self);
        } else {
            warn!(code = self.code(), "{}", self);
        }

        let body = ErrorResponse::new(self.code(), self.detail());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reframe_media::FetchError;

    #[test]
    fn test_input_errors_are_400() {
        assert_eq!(ApiError::MissingInput.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::AmbiguousInput.code(), "ambiguous_input");
        assert_eq!(
            ApiError::invalid_parameter("h").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_media_error_mapping() {
        let err: ApiError = MediaError::Fetch(FetchError::Status(403)).into();
        assert_eq!(err.code(), "fetch_failed");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err: ApiError = MediaError::Cancelled.into();
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn test_convert_failed_detail_is_stderr_tail() {
        let stderr = format!("{}Invalid data found", "x".repeat(2000));
        let err: ApiError = MediaError::EngineExhausted {
            attempts: 3,
            message: "conservative encode failed".to_string(),
            stderr: Some(stderr),
        }
        .into();

        assert_eq!(err.code(), "convert_failed");
        let detail = err.detail();
        assert_eq!(detail.chars().count(), STDERR_DETAIL_CHARS);
        assert!(detail.ends_with("Invalid data found"));
    }

    #[test]
    fn test_convert_failed_without_stderr_uses_message() {
        let err: ApiError = MediaError::EmptyOutput.into();
        assert_eq!(err.detail(), "FFmpeg produced no output");
    }
}
