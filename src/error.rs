use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures of a counter backend. These never reach HTTP clients: the store
/// absorbs them by failing over to the in-process counters.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterConfigError {
    #[error("limiter name must not be empty")]
    EmptyName,
    #[error("limiter `{0}`: window must be at least one millisecond")]
    ZeroWindow(String),
    #[error("limiter `{0}`: max must be greater than zero")]
    ZeroMax(String),
    #[error("limiter `{name}`: invalid status code {status}")]
    InvalidStatus { name: String, status: u16 },
}

#[derive(Debug)]
pub enum ServiceError {
    RateLimited {
        status: StatusCode,
        message: String,
        retry_after_secs: u64,
    },
    PayloadTooLarge,
    Upstream(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThrottledBody<'a> {
    error: &'a str,
    message: &'a str,
    retry_after: u64,
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Too Many Requests",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing message. Internal and upstream details stay in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::RateLimited { message, .. } => message.clone(),
            Self::PayloadTooLarge => "Request body exceeds configured limit".to_string(),
            Self::Upstream(_) => "Upstream service unavailable".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { status, .. } => *status,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::Upstream(detail) | Self::Internal(detail) => detail.clone(),
            other => other.message(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut response = match &self {
            Self::RateLimited {
                message,
                retry_after_secs,
                ..
            } => (
                status,
                Json(ThrottledBody {
                    error: self.code(),
                    message,
                    retry_after: *retry_after_secs,
                }),
            )
                .into_response(),
            _ => (
                status,
                Json(ErrorBody {
                    error: self.code(),
                    message: self.message(),
                }),
            )
                .into_response(),
        };

        if let Self::RateLimited {
            retry_after_secs, ..
        } = self
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[tokio::test]
    async fn throttled_response_carries_retry_after_and_camel_case_body() {
        let response = ServiceError::RateLimited {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "slow down".to_string(),
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["message"], "slow down");
        assert_eq!(json["retryAfter"], 42);
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() {
        let response = ServiceError::Internal("redis at 10.0.0.3 refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("10.0.0.3"));
    }
}
