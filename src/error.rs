//! Error codes and JSON error responses shared by all services

use crate::body::{full, Body};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request or missing parameter
    BadRequest,
    /// Unknown route or missing media file
    NotFound,
    /// Known route, wrong method
    MethodNotAllowed,
    /// Upstream unreachable or returned something unusable
    UpstreamError,
    /// Upstream did not answer in time
    UpstreamTimeout,
    /// External binary missing or not runnable
    ToolUnavailable,
    /// Conversion queue is full
    Busy,
    /// Extractor or transcoder exited with an error
    ConversionFailed,
    /// Extractor or transcoder exceeded the job timeout
    ConversionTimeout,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ConversionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConversionTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorCode::ToolUnavailable => "TOOL_UNAVAILABLE",
            ErrorCode::Busy => "BUSY",
            ErrorCode::ConversionFailed => "CONVERSION_FAILED",
            ErrorCode::ConversionTimeout => "CONVERSION_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
///
/// `detail` mirrors the key FastAPI uses for `HTTPException`, so existing
/// clients of the Python services keep parsing errors unchanged.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub detail: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response with the code's default status
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            detail: detail.into(),
        }
    }

    /// Override the status, used when relaying an upstream error status
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status.as_u16();
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","detail":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.detail.replace('\"', "\\\""),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<Body> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header(X_GATEWAY_ERROR, self.code.as_header_value())
            .body(full(body))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: ErrorCode, detail: impl Into<String>) -> Response<Body> {
    ErrorResponse::new(code, detail).into_response()
}
