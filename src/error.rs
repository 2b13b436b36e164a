//! Error codes and error responses for the load balancer and control API

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors the load balancer reports instead of an upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Failed to connect to or talk to the backend
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    UpstreamTimeout,
    /// No backends configured
    NoBackends,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::NoBackends => "NO_BACKENDS",
        }
    }
}

/// Errors that end a forwarded response body early
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    /// Reading the upstream body failed
    #[error("Upstream body error: {0}")]
    Upstream(#[from] hyper::Error),
    /// No frame arrived from upstream within the idle timeout
    #[error("Upstream body idle for {0:?}")]
    IdleTimeout(Duration),
}

/// Body type of every response the load balancer writes
pub type ProxyBody = BoxBody<Bytes, BodyError>;

/// Create a plain-text gateway error response with X-Proxy-Error header
pub fn proxy_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors the control API reports for rejected requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlErrorCode {
    /// Backend id not in the registry
    InvalidBackend,
    /// Body is not a valid action request
    MalformedBody,
    /// Body exceeds the size limit
    PayloadTooLarge,
    /// Missing or wrong bearer token
    Unauthorized,
    /// No such route or file
    NotFound,
}

impl ControlErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlErrorCode::InvalidBackend => StatusCode::BAD_REQUEST,
            ControlErrorCode::MalformedBody => StatusCode::BAD_REQUEST,
            ControlErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ControlErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// The error code
    pub code: ControlErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ControlErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"message":"{}"}}"#,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}
