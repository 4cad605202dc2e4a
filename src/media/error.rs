use crate::error::{ErrorCode, ErrorResponse};
use crate::tools::ToolError;

/// Errors raised by the media gateway
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("missing 'url' or 'q' parameter")]
    MissingSource,
    #[error("unsupported source '{0}': expected an http:// or https:// URL")]
    InvalidSource(String),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("invalid media file name")]
    InvalidFileName,
    #[error("media file not found: {0}")]
    NotFound(String),
    #[error("conversion queue is full, retry later")]
    Busy,
    #[error("extractor produced no media file")]
    NoOutput,
    #[error("unexpected extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("media storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MediaError::MissingSource
            | MediaError::InvalidSource(_)
            | MediaError::InvalidBody(_)
            | MediaError::InvalidFileName => ErrorCode::BadRequest,
            MediaError::NotFound(_) => ErrorCode::NotFound,
            MediaError::Busy => ErrorCode::Busy,
            MediaError::NoOutput | MediaError::Parse(_) => ErrorCode::ConversionFailed,
            MediaError::Tool(ToolError::NotFound { .. } | ToolError::Spawn { .. }) => {
                ErrorCode::ToolUnavailable
            }
            MediaError::Tool(ToolError::Failed { .. }) => ErrorCode::ConversionFailed,
            MediaError::Tool(ToolError::Timeout { .. }) => ErrorCode::ConversionTimeout,
            MediaError::Io(_) => ErrorCode::InternalError,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::time::Duration;

    #[test]
    fn test_error_codes() {
        assert_eq!(MediaError::MissingSource.code(), ErrorCode::BadRequest);
        assert_eq!(MediaError::InvalidFileName.code(), ErrorCode::BadRequest);
        assert_eq!(MediaError::NotFound("x.mp3".into()).code(), ErrorCode::NotFound);
        assert_eq!(MediaError::Busy.code(), ErrorCode::Busy);
        assert_eq!(
            MediaError::Tool(ToolError::NotFound {
                tool: "extractor",
                program: "yt-dlp".into()
            })
            .code(),
            ErrorCode::ToolUnavailable
        );
        assert_eq!(
            MediaError::Tool(ToolError::Timeout {
                tool: "transcoder",
                timeout: Duration::from_secs(1)
            })
            .code(),
            ErrorCode::ConversionTimeout
        );
    }

    #[test]
    fn test_tool_failure_detail_is_kept() {
        let err = MediaError::Tool(ToolError::Failed {
            tool: "extractor",
            status: "exit status: 1".into(),
            stderr: "ERROR: Video unavailable".into(),
        });
        let response = err.to_error_response();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR.as_u16());
        assert!(response.detail.contains("Video unavailable"));
    }
}
