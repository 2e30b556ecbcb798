//! Fallback Chain Execution
//!
//! Walks an ordered list of backends until one answers. Each backend gets a
//! fixed budget of tries before the chain moves on.
//!
//! # Architecture
//!
//! ```text
//! chat(request)
//!     |
//!     v
//! Backend A: try 1 .. try (1 + retries)   -- all fail -->  on_fallback(A, B, err)
//!     |                                                         |
//!     |  circuit open: skip remaining budget                    v
//!     |                                      Backend B: try 1 .. (1 + retries)
//!     v                                                         |
//! success: FallbackResponse { used_fallback, attempted, failures }
//!     or
//! FallbackError::AllBackendsFailed { per-backend last failure }
//! ```
//!
//! # Counting
//!
//! The first call to a backend is attempt 1. A budget of `max_retries = 2`
//! means up to 3 calls to that backend.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendError, BackendExecutor, BackendId, RequestEnvelope, ResponseEnvelope};

// ============================================================================
// Configuration
// ============================================================================

/// Fallback chain configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Backends in the order they are tried
    pub backends: Vec<BackendId>,

    /// Retries per backend after its first try
    pub max_retries: u32,

    /// Per-backend retry budget overrides
    pub backend_retries: HashMap<BackendId, u32>,

    /// Pause between tries on the same backend
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            max_retries: 2,
            backend_retries: HashMap::new(),
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl FallbackConfig {
    /// Chain over `backends` with default budgets
    #[must_use]
    pub fn new(backends: Vec<BackendId>) -> Self {
        Self {
            backends,
            ..Self::default()
        }
    }

    /// Set the default retry budget
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Override the retry budget for one backend
    #[must_use]
    pub fn with_backend_retries(mut self, backend: BackendId, retries: u32) -> Self {
        self.backend_retries.insert(backend, retries);
        self
    }

    /// Set the delay between tries on the same backend
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Total tries allowed for `backend`
    #[must_use]
    pub fn tries_for(&self, backend: &BackendId) -> u32 {
        1 + self
            .backend_retries
            .get(backend)
            .copied()
            .unwrap_or(self.max_retries)
    }

    /// Reject empty chains and repeated backends
    ///
    /// # Errors
    ///
    /// [`FallbackError::EmptyChain`] or [`FallbackError::DuplicateBackend`].
    pub fn validate(&self) -> Result<(), FallbackError> {
        if self.backends.is_empty() {
            return Err(FallbackError::EmptyChain);
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend) {
                return Err(FallbackError::DuplicateBackend(backend.clone()));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Attempt Failures
// ============================================================================

/// Error type an attempt can fail with
pub trait AttemptFailure: fmt::Display + Send + 'static {
    /// The backend refused without doing work; try the next one at once
    fn skips_backend(&self) -> bool {
        false
    }

    /// Another try on the same backend could succeed
    fn is_retryable(&self) -> bool {
        true
    }
}

impl AttemptFailure for BackendError {
    fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}

/// One failed try
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Backend that failed
    pub backend: BackendId,

    /// Try number on that backend, starting at 1
    pub attempt: u32,

    /// Rendered error
    pub message: String,

    /// The backend was skipped without running
    pub skipped: bool,

    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Fallback failures
#[derive(Clone, Debug, Error)]
pub enum FallbackError {
    /// No backends configured
    #[error("fallback chain is empty")]
    EmptyChain,

    /// A backend appears twice
    #[error("backend {0} appears more than once in the fallback chain")]
    DuplicateBackend(BackendId),

    /// Every backend used up its budget
    #[error("all backends failed: {}", summarize(.failures))]
    AllBackendsFailed {
        /// Every failed try, in order
        failures: Vec<FailureRecord>,
    },
}

impl FallbackError {
    /// Failure records, when all backends failed
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        match self {
            Self::AllBackendsFailed { failures } => failures,
            _ => &[],
        }
    }
}

/// `a/x (3 attempts): last error; b/y (1 attempt): last error`
fn summarize(failures: &[FailureRecord]) -> String {
    let mut order: Vec<&BackendId> = Vec::new();
    let mut last: HashMap<&BackendId, &FailureRecord> = HashMap::new();
    for record in failures {
        if !last.contains_key(&record.backend) {
            order.push(&record.backend);
        }
        last.insert(&record.backend, record);
    }
    order
        .into_iter()
        .filter_map(|backend| last.get(backend))
        .map(|record| {
            let plural = if record.attempt == 1 { "" } else { "s" };
            format!(
                "{} ({} attempt{plural}): {}",
                record.backend, record.attempt, record.message
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Fallback Manager
// ============================================================================

/// Successful chain outcome
#[derive(Clone, Debug)]
pub struct FallbackResponse {
    /// Response from the backend that answered
    pub response: ResponseEnvelope,

    /// True when the answering backend was not the first in the chain
    pub used_fallback: bool,

    /// Backends tried, in order, including the one that answered
    pub attempted_backends: Vec<BackendId>,

    /// Failed tries before the success
    pub failures: Vec<FailureRecord>,
}

/// Runs one try against one backend
pub type AttemptFn<E> =
    Arc<dyn Fn(BackendId, RequestEnvelope) -> BoxFuture<'static, Result<ResponseEnvelope, E>> + Send + Sync>;

/// Called when the chain moves on: `(from, to, last failure)`
pub type FallbackHook = Arc<dyn Fn(&BackendId, &BackendId, &FailureRecord) + Send + Sync>;

/// Ordered fallback over a list of backends
pub struct FallbackManager<E = BackendError> {
    config: FallbackConfig,
    attempt: AttemptFn<E>,
    on_fallback: Option<FallbackHook>,
}

impl<E> Clone for FallbackManager<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            attempt: Arc::clone(&self.attempt),
            on_fallback: self.on_fallback.clone(),
        }
    }
}

impl<E: AttemptFailure> FallbackManager<E> {
    /// Create a manager; the chain is validated here
    ///
    /// # Errors
    ///
    /// See [`FallbackConfig::validate`].
    pub fn new(config: FallbackConfig, attempt: AttemptFn<E>) -> Result<Self, FallbackError> {
        config.validate()?;
        Ok(Self {
            config,
            attempt,
            on_fallback: None,
        })
    }

    /// Observe transitions between backends
    #[must_use]
    pub fn on_fallback<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BackendId, &BackendId, &FailureRecord) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(hook));
        self
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Try each backend in order until one succeeds
    ///
    /// # Errors
    ///
    /// [`FallbackError::AllBackendsFailed`] with every failed try.
    pub async fn chat(&self, request: &RequestEnvelope) -> Result<FallbackResponse, FallbackError> {
        let mut attempted = Vec::new();
        let mut failures: Vec<FailureRecord> = Vec::new();

        for (index, backend) in self.config.backends.iter().enumerate() {
            attempted.push(backend.clone());
            let tries = self.config.tries_for(backend);

            for attempt in 1..=tries {
                match (self.attempt)(backend.clone(), request.clone()).await {
                    Ok(response) => {
                        if index > 0 {
                            tracing::info!(
                                backend = %backend,
                                failed_tries = failures.len(),
                                "Fallback backend answered"
                            );
                        }
                        return Ok(FallbackResponse {
                            response,
                            used_fallback: index > 0,
                            attempted_backends: attempted,
                            failures,
                        });
                    }
                    Err(error) => {
                        let skipped = error.skips_backend();
                        let retryable = error.is_retryable();
                        tracing::warn!(
                            backend = %backend,
                            attempt,
                            tries,
                            skipped,
                            error = %error,
                            "Fallback attempt failed"
                        );
                        failures.push(FailureRecord {
                            backend: backend.clone(),
                            attempt,
                            message: error.to_string(),
                            skipped,
                            timestamp: Utc::now(),
                        });
                        if skipped || !retryable {
                            break;
                        }
                        if attempt < tries && !self.config.retry_delay.is_zero() {
                            tokio::time::sleep(self.config.retry_delay).await;
                        }
                    }
                }
            }

            if let (Some(next), Some(last)) = (self.config.backends.get(index + 1), failures.last()) {
                tracing::info!(from = %backend, to = %next, "Falling back to next backend");
                if let Some(hook) = &self.on_fallback {
                    hook(backend, next, last);
                }
            }
        }

        tracing::error!(
            backends = attempted.len(),
            failures = failures.len(),
            "All fallback backends failed"
        );
        Err(FallbackError::AllBackendsFailed { failures })
    }
}

impl FallbackManager<BackendError> {
    /// Manager that calls an executor directly
    ///
    /// # Errors
    ///
    /// See [`FallbackConfig::validate`].
    pub fn for_executor(
        config: FallbackConfig,
        executor: Arc<dyn BackendExecutor>,
    ) -> Result<Self, FallbackError> {
        let attempt: AttemptFn<BackendError> = Arc::new(move |backend, request| {
            let executor = Arc::clone(&executor);
            Box::pin(async move { executor.execute(&backend, &request).await })
        });
        Self::new(config, attempt)
    }
}

impl<E> fmt::Debug for FallbackManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackManager")
            .field("config", &self.config)
            .field("has_hook", &self.on_fallback.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
