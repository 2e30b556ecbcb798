//! Resilience primitives
//!
//! Each primitive keeps its own per-backend state and can be used alone.
//! The [`Orchestrator`](crate::orchestrator::Orchestrator) composes them in
//! this order around a single executor call:
//!
//! ```text
//! queue -> rate limiter -> circuit breaker -> retry -> executor
//! ```
//!
//! with the fallback manager walking several backends through that pipeline.

pub mod circuit_breaker;
pub mod fallback;
pub mod queue;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigPatch, CircuitError, CircuitEvent,
    CircuitEventKind, CircuitState, CircuitStats,
};
pub use fallback::{
    AttemptFailure, AttemptFn, FailureRecord, FallbackConfig, FallbackError, FallbackHook,
    FallbackManager, FallbackResponse,
};
pub use queue::{
    BackendQueueStats, EnqueueOptions, QueueConfig, QueueError, QueueHandler, QueueStage,
    QueueStats, RequestQueue,
};
pub use rate_limiter::{
    Admission, RateLimitError, RateLimiter, RateLimiterConfig, RateLimiterStats, RateLimits,
};
pub use retry::{with_retry, RetryConfig, RetryError, RetryMetadata, RetryPolicy};
