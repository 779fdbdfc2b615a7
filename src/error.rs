//! Wire-level rejections emitted by the router

use hyper::StatusCode;

/// Short-circuit outcomes that never reach a tenant handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Host header missing or empty
    InvalidHost,
    /// Path failed percent-decoding or contains a disallowed character
    InvalidUrl,
    /// No tenant answers for this host on this port
    HostNotFound,
    /// Tenant handler failed
    Internal,
}

impl Rejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Rejection::InvalidHost => StatusCode::BAD_REQUEST,
            Rejection::InvalidUrl => StatusCode::BAD_REQUEST,
            Rejection::HostNotFound => StatusCode::NOT_FOUND,
            Rejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response body
    pub fn body(&self) -> &'static str {
        match self {
            Rejection::InvalidHost => "Bad Request: Invalid host request header\n",
            Rejection::InvalidUrl => "Bad Request: Invalid URL\n",
            Rejection::HostNotFound => "Not Found: Host not found\n",
            Rejection::Internal => "Server Error: Unexpected server error\n",
        }
    }
}
