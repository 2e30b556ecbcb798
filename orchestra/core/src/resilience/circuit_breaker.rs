//! Per-Backend Circuit Breaker
//!
//! Fails fast when a backend is unhealthy instead of spending retries and
//! latency on calls that are going to fail.
//!
//! # State Machine
//!
//! ```text
//!              failure_threshold consecutive failures
//!              or failure rate >= threshold in window
//! +--------+ -----------------------------------------> +------+
//! | Closed |                                            | Open |
//! +--------+ <--+                                   +-> +------+
//!               |                                   |      |
//!               | success_threshold                 |      | reset_timeout
//!               | consecutive successes  any failure|      | elapsed
//!               |                                   |      v
//!               |                              +-----------+
//!               +----------------------------- | Half-Open |
//!                                              +-----------+
//! ```
//!
//! - **Closed**: calls pass through. Failures are counted.
//! - **Open**: calls are rejected with [`CircuitError::Open`] without being
//!   polled.
//! - **Half-Open**: calls pass through as probes.
//!
//! The `Open -> HalfOpen` transition is a stored deadline checked lazily on
//! every access, so no timer task exists and paused-clock tests are exact.
//!
//! # Thread Safety
//!
//! Each backend owns one [`CircuitRecord`] in a `DashMap`, guarded by its own
//! mutex. Unrelated backends never contend.
//!
//! # Events
//!
//! Transitions are published as [`CircuitEvent`]s on a broadcast channel.
//! Use [`CircuitBreaker::subscribe`] or [`CircuitBreaker::events`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::BackendId;

/// Capacity of the event channel; slow subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting requests
    Open,

    /// Probing for recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable name for logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker configuration
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Failure percentage (0-100) over the window that opens the circuit
    pub failure_rate_threshold: f64,

    /// Trailing window for failure-rate accounting
    pub failure_rate_window: Duration,

    /// Outcomes required in the window before the rate is evaluated
    pub minimum_requests: u32,

    /// Time spent open before probing
    pub reset_timeout: Duration,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// Hard cap on stored outcomes per backend
    pub max_window_entries: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 50.0,
            failure_rate_window: Duration::from_secs(60),
            minimum_requests: 10,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            max_window_entries: 1000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the failure-rate threshold in percent
    #[must_use]
    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent.clamp(0.0, 100.0);
        self
    }

    /// Set the failure-rate window
    #[must_use]
    pub fn with_failure_rate_window(mut self, window: Duration) -> Self {
        self.failure_rate_window = window;
        self
    }

    /// Set the minimum window population for rate evaluation
    #[must_use]
    pub fn with_minimum_requests(mut self, minimum: u32) -> Self {
        self.minimum_requests = minimum;
        self
    }

    /// Set the open duration
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the half-open success threshold
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Apply a partial update
    pub fn apply(&mut self, patch: &CircuitBreakerConfigPatch) {
        if let Some(v) = patch.failure_threshold {
            self.failure_threshold = v.max(1);
        }
        if let Some(v) = patch.failure_rate_threshold {
            self.failure_rate_threshold = v.clamp(0.0, 100.0);
        }
        if let Some(v) = patch.failure_rate_window {
            self.failure_rate_window = v;
        }
        if let Some(v) = patch.minimum_requests {
            self.minimum_requests = v;
        }
        if let Some(v) = patch.reset_timeout {
            self.reset_timeout = v;
        }
        if let Some(v) = patch.success_threshold {
            self.success_threshold = v.max(1);
        }
    }
}

/// Partial configuration update for [`CircuitBreaker::configure`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CircuitBreakerConfigPatch {
    /// New consecutive failure threshold
    pub failure_threshold: Option<u32>,
    /// New failure-rate threshold in percent
    pub failure_rate_threshold: Option<f64>,
    /// New failure-rate window
    pub failure_rate_window: Option<Duration>,
    /// New minimum window population
    pub minimum_requests: Option<u32>,
    /// New open duration
    pub reset_timeout: Option<Duration>,
    /// New half-open success threshold
    pub success_threshold: Option<u32>,
}

// ============================================================================
// Errors
// ============================================================================

/// Outcome of a call wrapped by the breaker
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the wrapped call was never made
    #[error("circuit open for {backend}; retry in {retry_after:?}")]
    Open {
        /// Backend whose circuit is open
        backend: BackendId,
        /// Time left until the circuit probes again
        retry_after: Duration,
    },

    /// The wrapped call ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// True when the call was rejected by an open circuit
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The inner error, if the call ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// What happened to a circuit
#[derive(Clone, Debug, PartialEq)]
pub enum CircuitEventKind {
    /// Any transition
    StateChange {
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// Circuit tripped
    Opened {
        /// Consecutive failures at the time of tripping
        consecutive_failures: u32,
        /// Failure rate (0-1) in the window at the time of tripping
        failure_rate: f64,
    },
    /// Circuit started probing
    HalfOpened,
    /// Circuit recovered
    Closed,
}

/// A circuit transition
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitEvent {
    /// Backend the circuit belongs to
    pub backend: BackendId,
    /// Transition details
    pub kind: CircuitEventKind,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
}

// ============================================================================
// Circuit Record
// ============================================================================

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    /// Scheduled `Open -> HalfOpen` deadline
    half_open_at: Option<Instant>,
    /// `(timestamp, failed)` outcomes inside the rate window
    window: VecDeque<(Instant, bool)>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            half_open_at: None,
            window: VecDeque::new(),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn prune(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        while let Some(&(ts, _)) = self.window.front() {
            if now.duration_since(ts) > config.failure_rate_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > config.max_window_entries {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Circuit state for a single backend
#[derive(Debug)]
pub struct CircuitRecord {
    backend: BackendId,
    inner: Mutex<CircuitInner>,
    rejected: AtomicU64,
}

impl CircuitRecord {
    fn new(backend: BackendId) -> Self {
        Self {
            backend,
            inner: Mutex::new(CircuitInner::new()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Backend this record belongs to
    #[must_use]
    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    /// Promote `Open -> HalfOpen` when the deadline has passed
    fn refresh(&self, inner: &mut CircuitInner, now: Instant, events: &mut Vec<CircuitEventKind>) {
        if inner.state == CircuitState::Open && inner.half_open_at.is_some_and(|at| now >= at) {
            self.transition(inner, CircuitState::HalfOpen, now, None, events);
        }
    }

    fn transition(
        &self,
        inner: &mut CircuitInner,
        to: CircuitState,
        now: Instant,
        config: Option<&CircuitBreakerConfig>,
        events: &mut Vec<CircuitEventKind>,
    ) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        events.push(CircuitEventKind::StateChange { from, to });

        match to {
            CircuitState::Open => {
                let reset_timeout = config.map_or(Duration::ZERO, |c| c.reset_timeout);
                inner.half_open_at = Some(now + reset_timeout);
                inner.consecutive_successes = 0;
                let failure_rate = inner.failure_rate();
                tracing::warn!(
                    backend = %self.backend,
                    consecutive_failures = inner.consecutive_failures,
                    failure_rate = failure_rate,
                    reset_timeout_ms = reset_timeout.as_millis() as u64,
                    "Circuit opened"
                );
                events.push(CircuitEventKind::Opened {
                    consecutive_failures: inner.consecutive_failures,
                    failure_rate,
                });
            }
            CircuitState::HalfOpen => {
                inner.half_open_at = None;
                inner.consecutive_successes = 0;
                tracing::info!(backend = %self.backend, "Circuit half-open, probing backend");
                events.push(CircuitEventKind::HalfOpened);
            }
            CircuitState::Closed => {
                inner.half_open_at = None;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.window.clear();
                tracing::info!(backend = %self.backend, "Circuit closed, backend recovered");
                events.push(CircuitEventKind::Closed);
            }
        }
    }

    /// Admit or reject a call
    fn try_acquire(&self, now: Instant, events: &mut Vec<CircuitEventKind>) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now, events);
        if inner.state == CircuitState::Open {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let retry_after = inner
                .half_open_at
                .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
            return Err(retry_after);
        }
        Ok(())
    }

    fn record_success(
        &self,
        now: Instant,
        config: &CircuitBreakerConfig,
        events: &mut Vec<CircuitEventKind>,
    ) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now, events);

        inner.total_requests += 1;
        inner.total_successes += 1;
        inner.window.push_back((now, false));
        inner.prune(now, config);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now, Some(config), events);
                }
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn record_failure(
        &self,
        now: Instant,
        config: &CircuitBreakerConfig,
        events: &mut Vec<CircuitEventKind>,
    ) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now, events);

        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Utc::now());
        inner.window.push_back((now, true));
        inner.prune(now, config);

        match inner.state {
            CircuitState::Closed => {
                let rate_tripped = inner.window.len() >= config.minimum_requests as usize
                    && inner.failure_rate() * 100.0 >= config.failure_rate_threshold;
                if inner.consecutive_failures >= config.failure_threshold || rate_tripped {
                    self.transition(&mut inner, CircuitState::Open, now, Some(config), events);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now, Some(config), events);
            }
            CircuitState::Open => {}
        }
    }

    fn force(
        &self,
        state: CircuitState,
        now: Instant,
        config: &CircuitBreakerConfig,
        events: &mut Vec<CircuitEventKind>,
    ) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, state, now, Some(config), events);
    }

    fn reset(&self, now: Instant, events: &mut Vec<CircuitEventKind>) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, now, None, events);
        *inner = CircuitInner::new();
        self.rejected.store(0, Ordering::Relaxed);
    }

    fn state(&self, now: Instant, events: &mut Vec<CircuitEventKind>) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now, events);
        inner.state
    }

    fn stats(&self, now: Instant, config: &CircuitBreakerConfig, events: &mut Vec<CircuitEventKind>) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now, events);
        inner.prune(now, config);
        CircuitStats {
            backend: self.backend.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_rate: inner.failure_rate(),
            window_requests: inner.window.len(),
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            last_failure: inner.last_failure,
            next_attempt_in: inner
                .half_open_at
                .map(|at| at.saturating_duration_since(now)),
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Point-in-time view of one backend's circuit
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitStats {
    /// Backend
    pub backend: BackendId,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Consecutive half-open successes
    pub consecutive_successes: u32,
    /// Failure rate (0-1) over the trailing window
    pub failure_rate: f64,
    /// Outcomes currently in the window
    pub window_requests: usize,
    /// Calls observed since creation or reset
    pub total_requests: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Failed calls
    pub total_failures: u64,
    /// Calls rejected while open
    pub rejected_requests: u64,
    /// Wall-clock time of the last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Time until the next probe, when open
    pub next_attempt_in: Option<Duration>,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breakers for every backend
///
/// ```ignore
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
/// let result = breaker.execute(&backend, async { call().await }).await;
/// ```
pub struct CircuitBreaker {
    records: DashMap<BackendId, Arc<CircuitRecord>>,
    config: RwLock<CircuitBreakerConfig>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            config: RwLock::new(config),
            events,
        }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.read().clone()
    }

    /// Apply a partial configuration update to all backends
    pub fn configure(&self, patch: &CircuitBreakerConfigPatch) {
        self.config.write().apply(patch);
        tracing::debug!(?patch, "Circuit breaker reconfigured");
    }

    /// Subscribe to transition events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Transition events as a stream
    #[must_use]
    pub fn events(&self) -> BroadcastStream<CircuitEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    fn record(&self, backend: &BackendId) -> Arc<CircuitRecord> {
        if let Some(record) = self.records.get(backend) {
            return record.clone();
        }
        self.records
            .entry(backend.clone())
            .or_insert_with(|| Arc::new(CircuitRecord::new(backend.clone())))
            .clone()
    }

    fn publish(&self, backend: &BackendId, kinds: Vec<CircuitEventKind>) {
        if kinds.is_empty() {
            return;
        }
        let at = Utc::now();
        for kind in kinds {
            // No subscribers is fine
            let _ = self.events.send(CircuitEvent {
                backend: backend.clone(),
                kind,
                at,
            });
        }
    }

    /// Run `call` through the backend's circuit
    ///
    /// Every `Err` counts as a failure. Use [`execute_filtered`] when some
    /// errors should not penalise the backend.
    ///
    /// [`execute_filtered`]: Self::execute_filtered
    ///
    /// # Errors
    ///
    /// [`CircuitError::Open`] when the circuit is open, otherwise the call's
    /// own error in [`CircuitError::Inner`].
    pub async fn execute<T, E, F>(&self, backend: &BackendId, call: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.execute_filtered(backend, call, |_| true).await
    }

    /// Run `call`, counting only errors for which `is_failure` is true
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_filtered<T, E, F, P>(
        &self,
        backend: &BackendId,
        call: F,
        is_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let record = self.record(backend);

        let mut events = Vec::new();
        let admitted = record.try_acquire(Instant::now(), &mut events);
        self.publish(backend, events);

        if let Err(retry_after) = admitted {
            tracing::debug!(backend = %backend, ?retry_after, "Circuit open, rejecting call");
            return Err(CircuitError::Open {
                backend: backend.clone(),
                retry_after,
            });
        }

        let result = call.await;
        let config = self.config();
        let mut events = Vec::new();
        match &result {
            Ok(_) => record.record_success(Instant::now(), &config, &mut events),
            Err(e) => {
                if is_failure(e) {
                    record.record_failure(Instant::now(), &config, &mut events);
                }
            }
        }
        self.publish(backend, events);

        result.map_err(CircuitError::Inner)
    }

    /// Whether a call to `backend` would currently be admitted
    #[must_use]
    pub fn is_available(&self, backend: &BackendId) -> bool {
        self.state(backend) != CircuitState::Open
    }

    /// Record a success observed outside [`execute`](Self::execute)
    pub fn record_success(&self, backend: &BackendId) {
        let config = self.config();
        let mut events = Vec::new();
        self.record(backend)
            .record_success(Instant::now(), &config, &mut events);
        self.publish(backend, events);
    }

    /// Record a failure observed outside [`execute`](Self::execute)
    pub fn record_failure(&self, backend: &BackendId) {
        let config = self.config();
        let mut events = Vec::new();
        self.record(backend)
            .record_failure(Instant::now(), &config, &mut events);
        self.publish(backend, events);
    }

    /// Current state of a backend's circuit
    #[must_use]
    pub fn state(&self, backend: &BackendId) -> CircuitState {
        let Some(record) = self.records.get(backend).map(|r| r.clone()) else {
            return CircuitState::Closed;
        };
        let mut events = Vec::new();
        let state = record.state(Instant::now(), &mut events);
        self.publish(backend, events);
        state
    }

    /// Statistics for a backend's circuit
    #[must_use]
    pub fn stats(&self, backend: &BackendId) -> CircuitStats {
        let config = self.config();
        let mut events = Vec::new();
        let stats = self.record(backend).stats(Instant::now(), &config, &mut events);
        self.publish(backend, events);
        stats
    }

    /// Statistics for every known backend, sorted by backend id
    #[must_use]
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let mut backends: Vec<BackendId> = self.records.iter().map(|e| e.key().clone()).collect();
        backends.sort();
        backends.iter().map(|b| self.stats(b)).collect()
    }

    /// Force a backend's circuit into a state (admin / testing)
    pub fn force_state(&self, backend: &BackendId, state: CircuitState) {
        let config = self.config();
        let mut events = Vec::new();
        self.record(backend)
            .force(state, Instant::now(), &config, &mut events);
        self.publish(backend, events);
    }

    /// Reset one backend's circuit to a fresh closed state
    pub fn reset(&self, backend: &BackendId) {
        if let Some(record) = self.records.get(backend).map(|r| r.clone()) {
            let mut events = Vec::new();
            record.reset(Instant::now(), &mut events);
            self.publish(backend, events);
            tracing::info!(backend = %backend, "Circuit reset");
        }
    }

    /// Reset every circuit
    pub fn reset_all(&self) {
        let backends: Vec<BackendId> = self.records.iter().map(|e| e.key().clone()).collect();
        for backend in &backends {
            self.reset(backend);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backends", &self.records.len())
            .field("config", &*self.config.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
