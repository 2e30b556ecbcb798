//! Orchestrator errors
//!
//! Each subsystem has its own error type; [`OrchestraError`] is what the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) returns, with one
//! variant per subsystem that can turn a request away.

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendId, ErrorKind};
use crate::resilience::{AttemptFailure, FallbackError, QueueError, RateLimitError, RetryError};
use crate::routing::RoutingError;

/// Subsystem responsible for a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Circuit breaker
    CircuitBreaker,
    /// Rate limiter
    RateLimiter,
    /// Request queue
    Queue,
    /// The backend itself (after retries)
    Backend,
    /// Fallback chain
    Fallback,
    /// Model router
    Router,
}

impl Subsystem {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::RateLimiter => "rate_limiter",
            Self::Queue => "queue",
            Self::Backend => "backend",
            Self::Fallback => "fallback",
            Self::Router => "router",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures returned by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestraError {
    /// The backend's circuit is open; nothing was sent
    #[error("circuit open for {backend}; retry in {retry_after:?}")]
    CircuitOpen {
        /// Backend whose circuit is open
        backend: BackendId,
        /// Time until the circuit probes again
        retry_after: Duration,
    },

    /// No rate-limit slot was granted
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// The request queue refused or expired the request
    #[error(transparent)]
    Queue(#[from] QueueError<Infallible>),

    /// The backend failed after retries
    #[error("{backend} failed: {source}")]
    Backend {
        /// Backend that failed
        backend: BackendId,
        /// Final error with retry history
        source: RetryError,
    },

    /// Every backend in a fallback chain failed
    #[error(transparent)]
    Fallback(#[from] FallbackError),

    /// No backend could be chosen
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl OrchestraError {
    /// Which subsystem produced the error
    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Self::CircuitOpen { .. } => Subsystem::CircuitBreaker,
            Self::RateLimit(_) => Subsystem::RateLimiter,
            Self::Queue(_) => Subsystem::Queue,
            Self::Backend { .. } => Subsystem::Backend,
            Self::Fallback(_) => Subsystem::Fallback,
            Self::Routing(_) => Subsystem::Router,
        }
    }

    /// Error kind reported by the backend, when it ran
    #[must_use]
    pub fn backend_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Backend { source, .. } => Some(source.error.kind),
            _ => None,
        }
    }

    /// Suggested wait before trying again, when known
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Backend { source, .. } => source.error.quota.and_then(|q| q.retry_after),
            _ => None,
        }
    }
}

impl From<QueueError<OrchestraError>> for OrchestraError {
    fn from(err: QueueError<OrchestraError>) -> Self {
        match err.into_failure() {
            Ok(inner) => inner,
            Err(admission) => Self::Queue(admission),
        }
    }
}

impl AttemptFailure for OrchestraError {
    fn skips_backend(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimit(_) | Self::Queue(_))
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.error.kind.is_transient(),
            Self::Fallback(_) | Self::Routing(_) => false,
            Self::CircuitOpen { .. } | Self::RateLimit(_) | Self::Queue(_) => true,
        }
    }
}
