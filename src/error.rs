use std::time::Duration;

use actix_web::{
    HttpResponse, ResponseError,
    http::{StatusCode, header},
};
use serde::Deserialize;
use thiserror::Error;

use crate::io_struct::ApiResponse;

/// Failures surfaced by the relay's own request handling.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Error: No access rights")]
    Unauthorized,

    #[error("Too many request from this IP in 1 hour")]
    RateLimited { retry_after: Duration },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

/// Outcome of an explicit `/verify` call. Reported in the body envelope
/// with a 200 status, never as an HTTP error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Secret key is empty")]
    Empty,

    #[error("密钥无效 | Secret key is invalid")]
    Invalid,
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let RelayError::RateLimited { retry_after } = self {
            // round up so clients never retry inside the window
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            builder.insert_header((header::RETRY_AFTER, secs.to_string()));
        }
        match self {
            RelayError::Unauthorized => {
                builder.json(ApiResponse::<()>::unauthorized(self.to_string()))
            }
            _ => builder.json(ApiResponse::<()>::fail(self.to_string())),
        }
    }
}

/// Failures talking to the upstream chat-completion service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("[OpenAI] {message}")]
    Status {
        status: http::StatusCode,
        message: String,
    },

    #[error("[OpenAI] {message}")]
    Api { message: String },

    #[error("[OpenAI] Gateway Time-out")]
    Timeout,

    #[error("[OpenAI] {0}")]
    Transport(reqwest::Error),

    #[error("[OpenAI] Invalid event data: {0}")]
    InvalidEvent(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(e)
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(e: serde_json::Error) -> Self {
        UpstreamError::InvalidEvent(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl UpstreamError {
    /// Maps a non-2xx upstream response to an error. Well-known statuses get
    /// a fixed message; anything else carries the upstream's own message.
    pub fn from_status(status: http::StatusCode, body: &[u8]) -> Self {
        let message = match status.as_u16() {
            401 => "Incorrect API key provided".to_string(),
            403 => "Server refused to access, please try again later".to_string(),
            500 => "Internal Server Error".to_string(),
            502 => "Bad Gateway".to_string(),
            503 => "Server is busy, please try again later".to_string(),
            504 => "Gateway Time-out".to_string(),
            _ => extract_message(body).unwrap_or_else(|| {
                format!(
                    "Upstream responded with {}",
                    status.canonical_reason().unwrap_or(status.as_str())
                )
            }),
        };
        UpstreamError::Status { status, message }
    }
}

/// Pulls `error.message` out of an OpenAI style error body.
pub(crate) fn extract_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorPayload>(body)
        .ok()
        .and_then(|payload| payload.error)
        .map(|detail| detail.message)
}
