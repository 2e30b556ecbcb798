//! Backend errors and their classification
//!
//! Executors may fail for any reason. Every failure is normalised into a
//! [`BackendError`] carrying an [`ErrorKind`], which is what the retry policy
//! and circuit breaker act on.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::quota::QuotaHint;

/// Failure category of a backend call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 429 or provider quota exhausted
    RateLimit,
    /// Request or connection timed out
    Timeout,
    /// 5xx other than 503
    ServerError,
    /// Connection refused, reset, DNS failure
    NetworkError,
    /// 503 or provider overloaded
    ServiceUnavailable,
    /// 401 / 403 or invalid credentials
    Auth,
    /// Other 4xx
    InvalidRequest,
    /// Anything we could not classify
    Other,
}

impl ErrorKind {
    /// Whether this kind is transient in nature
    ///
    /// The retry policy only retries transient kinds listed in its
    /// `retry_on` set.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::Timeout
                | Self::ServerError
                | Self::NetworkError
                | Self::ServiceUnavailable
        )
    }

    /// Classify an HTTP status code
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            408 | 504 => Self::Timeout,
            503 => Self::ServiceUnavailable,
            500..=599 => Self::ServerError,
            401 | 403 => Self::Auth,
            400..=499 => Self::InvalidRequest,
            _ => Self::Other,
        }
    }

    /// Classify a free-form error message by keyword
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["rate limit", "ratelimit", "too many requests", "429", "quota exceeded"]) {
            Self::RateLimit
        } else if has(&["timeout", "timed out", "etimedout", "deadline exceeded"]) {
            Self::Timeout
        } else if has(&["service unavailable", "503", "overloaded"]) {
            Self::ServiceUnavailable
        } else if has(&[
            "econnreset",
            "econnrefused",
            "enotfound",
            "socket hang up",
            "network",
            "connection reset",
            "connection refused",
            "dns",
        ]) {
            Self::NetworkError
        } else if has(&["internal server error", "bad gateway", "500", "502"]) {
            Self::ServerError
        } else if has(&[
            "unauthorized",
            "forbidden",
            "invalid api key",
            "authentication",
            "401",
            "403",
        ]) {
            Self::Auth
        } else {
            Self::Other
        }
    }

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed backend call
#[derive(Clone, Debug, Error)]
pub struct BackendError {
    /// Failure category
    pub kind: ErrorKind,
    /// HTTP status, when known
    pub status: Option<u16>,
    /// Human-readable message
    pub message: String,
    /// Quota information returned with the failure
    pub quota: Option<QuotaHint>,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl BackendError {
    /// Create an error of a known kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            quota: None,
        }
    }

    /// Create an error from an HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
            quota: None,
        }
    }

    /// Create an error by classifying its message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    /// Normalise an arbitrary `anyhow` error
    ///
    /// Recognises wrapped `BackendError`s and `reqwest` errors before falling
    /// back to message classification.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(inner) = err.downcast_ref::<BackendError>() {
            return inner.clone();
        }
        if let Some(inner) = err.downcast_ref::<reqwest::Error>() {
            return Self::from_reqwest(inner);
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Self::timeout(err.to_string());
        }
        Self::from_message(format!("{err:#}"))
    }

    /// Classify a `reqwest` transport error
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_connect() {
            Self::network(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else if err.is_request() || err.is_body() {
            Self::network(err.to_string())
        } else {
            Self::from_message(err.to_string())
        }
    }

    /// Rate-limit error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::from_status(429, message)
    }

    /// Timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Server error (500)
    pub fn server(message: impl Into<String>) -> Self {
        Self::from_status(500, message)
    }

    /// Network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    /// Service unavailable (503)
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::from_status(503, message)
    }

    /// Authentication failure (401)
    pub fn auth(message: impl Into<String>) -> Self {
        Self::from_status(401, message)
    }

    /// Attach quota information
    #[must_use]
    pub fn with_quota(mut self, quota: QuotaHint) -> Self {
        self.quota = Some(quota);
        self
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest(&err)
    }
}

impl From<tokio::time::error::Elapsed> for BackendError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout(err.to_string())
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(&err)
    }
}
