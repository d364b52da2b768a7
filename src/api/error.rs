use std::time::Duration;
use thiserror::Error;

/// Every failure the request pipeline can surface.
///
/// `Authentication` and `NotFound` are fatal and never retried.
/// `RateLimit` and `Api` are transient and eligible for the retry loop.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("resource not found: {url}")]
    NotFound { url: String },

    #[error("rate limit exceeded (retry after: {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("{message}")]
    Api {
        status: Option<u16>,
        body: Option<String>,
        message: String,
    },
}

/// Coarse classification, handy for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Authentication,
    NotFound,
    RateLimit,
    Api,
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Authentication { .. } => ApiErrorKind::Authentication,
            ApiError::NotFound { .. } => ApiErrorKind::NotFound,
            ApiError::RateLimit { .. } => ApiErrorKind::RateLimit,
            ApiError::Api { .. } => ApiErrorKind::Api,
        }
    }

    /// Whether the outer retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimit { .. } | ApiError::Api { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Authentication { .. } => Some(401),
            ApiError::NotFound { .. } => Some(404),
            ApiError::RateLimit { .. } => Some(429),
            ApiError::Api { status, .. } => *status,
        }
    }

    pub(crate) fn from_status(status: u16, body: String) -> Self {
        ApiError::Api {
            status: Some(status),
            message: format!("API error {}: {}", status, body),
            body: Some(body),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        ApiError::Api {
            status: None,
            body: None,
            message: format!("Request failed: {}", message.into()),
        }
    }
}

/// Failure raised by an [`HttpTransport`](super::transport::HttpTransport)
/// before any HTTP status was observed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}
