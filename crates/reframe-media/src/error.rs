//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors raised while acquiring a remote or uploaded source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Too many redirects (limit {0})")]
    RedirectLoop(usize),

    #[error("Expected media but received {0}")]
    ContentTypeMismatch(String),

    #[error("Source exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Fetch timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FetchError::Status(status.as_u16()),
            None => FetchError::Request(e.to_string()),
        }
    }
}

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFmpeg produced no output")]
    EmptyOutput,

    #[error("All {attempts} conversion attempts failed: {message}")]
    EngineExhausted {
        attempts: u32,
        message: String,
        stderr: Option<String>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether another, more conservative engine attempt may still succeed.
    ///
    /// Cancellation, missing binaries and source fetch failures end the
    /// ladder immediately; only engine failures move to the next tier.
    pub fn is_engine_retryable(&self) -> bool {
        matches!(
            self,
            MediaError::FfmpegFailed { .. }
                | MediaError::EmptyOutput
                | MediaError::Timeout(_)
                | MediaError::Io(_)
        )
    }

    /// Captured engine stderr, when there is any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            MediaError::FfmpegFailed { stderr, .. }
            | MediaError::FfprobeFailed { stderr, .. }
            | MediaError::EngineExhausted { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MediaError::EmptyOutput.is_engine_retryable());
        assert!(MediaError::ffmpeg_failed("x", None, Some(1)).is_engine_retryable());
        assert!(!MediaError::Cancelled.is_engine_retryable());
        assert!(!MediaError::FfmpegNotFound.is_engine_retryable());
        assert!(!MediaError::Fetch(FetchError::Status(403)).is_engine_retryable());
        assert!(!MediaError::Fetch(FetchError::Request("reset".into())).is_engine_retryable());
    }

    #[test]
    fn test_stderr_accessor() {
        let err = MediaError::ffmpeg_failed("x", Some("Invalid argument".into()), Some(234));
        assert_eq!(err.stderr(), Some("Invalid argument"));
        assert_eq!(MediaError::EmptyOutput.stderr(), None);
    }
}
