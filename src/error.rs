use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::admission::DenyReason;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rate limit exceeded ({reason})")]
    RateLimited {
        reason: DenyReason,
        retry_after: Duration,
    },

    #[error("server is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Bind { .. } | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            reason: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let code = err.status_code().as_u16();
        match err {
            Error::RateLimited { reason, .. } => Self {
                reason: Some(*reason),
                ..Self::new(
                    "rate_limit_exceeded",
                    "Too many requests, please try again later",
                    code,
                )
            },
            Error::ShuttingDown => Self::new("shutting_down", "Server is shutting down", code),
            Error::Config(_) | Error::Bind { .. } | Error::Io(_) => {
                Self::new("internal_error", &err.to_string(), code)
            }
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut response =
            (self.status_code(), Json(ErrorResponse::from_error(&self))).into_response();

        if let Error::RateLimited { retry_after, .. } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(2)), 2);
        assert_eq!(retry_after_secs(Duration::from_millis(2001)), 3);
    }

    #[test]
    fn test_rate_limited_response() {
        let response = Error::RateLimited {
            reason: DenyReason::ClientLimit,
            retry_after: Duration::from_millis(1500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_error_body_includes_reason() {
        let body = ErrorResponse::from_error(&Error::RateLimited {
            reason: DenyReason::GlobalLimit,
            retry_after: Duration::from_secs(1),
        });
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["code"], 429);
        assert_eq!(json["reason"], "global_limit");
    }

    #[test]
    fn test_shutting_down_is_unavailable() {
        let response = Error::ShuttingDown.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = serde_json::to_value(ErrorResponse::from_error(&Error::ShuttingDown)).unwrap();
        assert!(json.get("reason").is_none());
    }
}
