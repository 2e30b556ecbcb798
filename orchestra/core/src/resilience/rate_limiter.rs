//! Per-Backend Rate Limiting
//!
//! Gates calls to each backend using two local sliding windows (1 s and
//! 60 s) plus the most recent [`QuotaHint`] reported by the provider.
//!
//! # Design
//!
//! - Each backend owns a [`RateWindow`] of recent request timestamps.
//! - A call may proceed when the provider has not reported an exhausted
//!   quota and neither window has reached its limit.
//! - Callers that cannot proceed queue FIFO per backend. Only the head of the
//!   queue sleeps, and it sleeps for exactly the computed wait; the rest park
//!   on a `Notify` until the head is admitted.
//! - Waiting never rejects, except when `max_queue_size` callers are already
//!   waiting or the caller has waited longer than `acquire_timeout`.
//!
//! # Usage
//!
//! ```ignore
//! let limiter = RateLimiter::new(RateLimiterConfig::default());
//! limiter.set_limits(&backend, RateLimits::new().with_requests_per_second(5));
//! limiter.acquire(&backend).await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::{BackendId, QuotaHint};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Request limits for one backend; `None` means unlimited
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimits {
    /// Requests allowed in any trailing 1 s window
    pub requests_per_second: Option<u32>,

    /// Requests allowed in any trailing 60 s window
    pub requests_per_minute: Option<u32>,
}

impl RateLimits {
    /// Unlimited
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-second limit
    #[must_use]
    pub fn with_requests_per_second(mut self, limit: u32) -> Self {
        self.requests_per_second = Some(limit.max(1));
        self
    }

    /// Set the per-minute limit
    #[must_use]
    pub fn with_requests_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = Some(limit.max(1));
        self
    }

    /// Raise any zero limit to 1
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            requests_per_second: self.requests_per_second.map(|l| l.max(1)),
            requests_per_minute: self.requests_per_minute.map(|l| l.max(1)),
        }
    }
}

/// Rate limiter configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimiterConfig {
    /// Limits for backends without an explicit override
    pub default_limits: RateLimits,

    /// Honour provider quota hints
    pub auto_throttle: bool,

    /// Maximum callers waiting per backend
    pub max_queue_size: usize,

    /// Longest a caller may wait for a slot
    pub acquire_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_limits: RateLimits::default(),
            auto_throttle: true,
            max_queue_size: 100,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default limits
    #[must_use]
    pub fn with_default_limits(mut self, limits: RateLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Enable or disable quota-hint throttling
    #[must_use]
    pub fn with_auto_throttle(mut self, enabled: bool) -> Self {
        self.auto_throttle = enabled;
        self
    }

    /// Set the waiting-caller cap
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the acquire timeout
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while waiting for a rate-limit slot
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many callers already waiting
    #[error("rate limit queue full for {backend} ({max} waiting)")]
    QueueFull {
        /// Backend
        backend: BackendId,
        /// Configured cap
        max: usize,
    },

    /// Waited longer than the acquire timeout
    #[error("timed out after {waited:?} waiting for rate limit on {backend}")]
    Timeout {
        /// Backend
        backend: BackendId,
        /// Time spent waiting
        waited: Duration,
    },
}

/// Result of an admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A call may proceed now
    Allowed,

    /// A call may proceed after this delay
    Wait(Duration),
}

impl Admission {
    /// Whether the call may proceed now
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The delay, if any
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Wait(d) => Some(*d),
            Self::Allowed => None,
        }
    }
}

// =============================================================================
// Rate Window
// =============================================================================

/// Sliding-window state for one backend
#[derive(Debug)]
pub struct RateWindow {
    limits: RateLimits,
    /// Admission timestamps within the last minute, oldest first
    timestamps: VecDeque<Instant>,
    hint: Option<QuotaHint>,
    /// FIFO of waiting tickets
    waiting: VecDeque<u64>,
    next_ticket: u64,
    admitted: u64,
    throttled: u64,
}

impl RateWindow {
    fn new(limits: RateLimits) -> Self {
        Self {
            limits: limits.normalized(),
            timestamps: VecDeque::new(),
            hint: None,
            waiting: VecDeque::new(),
            next_ticket: 0,
            admitted: 0,
            throttled: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&ts) = self.timestamps.front() {
            if now.duration_since(ts) >= MINUTE {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|ts| now.duration_since(**ts) < window)
            .count()
    }

    /// Wait until a window of `span` holds fewer than `limit` entries
    fn window_wait(&self, now: Instant, span: Duration, limit: u32) -> Option<Duration> {
        let limit = limit.max(1) as usize;
        if self.count_within(now, span) < limit {
            return None;
        }
        let idx = self.timestamps.len().checked_sub(limit)?;
        let frees_at = self.timestamps[idx] + span;
        Some(frees_at.saturating_duration_since(now))
    }

    fn admission(&mut self, now: Instant, auto_throttle: bool) -> Admission {
        self.prune(now);

        let mut wait = Duration::ZERO;
        if auto_throttle {
            if let Some(d) = self.hint.and_then(|h| h.wait_time(now)) {
                wait = wait.max(d);
            }
        }
        if let Some(rps) = self.limits.requests_per_second {
            if let Some(d) = self.window_wait(now, SECOND, rps) {
                wait = wait.max(d);
            }
        }
        if let Some(rpm) = self.limits.requests_per_minute {
            if let Some(d) = self.window_wait(now, MINUTE, rpm) {
                wait = wait.max(d);
            }
        }

        if wait.is_zero() {
            Admission::Allowed
        } else {
            Admission::Wait(wait)
        }
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.admitted += 1;
    }
}

struct BackendLimiter {
    state: Mutex<RateWindow>,
    turn: Notify,
}

/// Removes an abandoned ticket so later callers are not blocked behind it
struct TicketGuard<'a> {
    limiter: &'a BackendLimiter,
    ticket: u64,
    admitted: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.limiter.state.lock().waiting.retain(|t| *t != self.ticket);
            self.limiter.turn.notify_waiters();
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time view of one backend's rate limiting
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimiterStats {
    /// Backend
    pub backend: BackendId,
    /// Limits in effect
    pub limits: RateLimits,
    /// Admissions in the trailing second
    pub requests_last_second: usize,
    /// Admissions in the trailing minute
    pub requests_last_minute: usize,
    /// Callers currently waiting
    pub waiting: usize,
    /// Admissions since creation
    pub admitted_total: u64,
    /// Admissions that had to wait
    pub throttled_total: u64,
    /// Latest provider quota hint
    pub hint: Option<QuotaHint>,
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Rate limiter for every backend
pub struct RateLimiter {
    config: RateLimiterConfig,
    backends: DashMap<BackendId, Arc<BackendLimiter>>,
}

impl RateLimiter {
    /// Create a rate limiter
    #[must_use]
    pub fn new(mut config: RateLimiterConfig) -> Self {
        config.default_limits = config.default_limits.normalized();
        Self {
            config,
            backends: DashMap::new(),
        }
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn limiter(&self, backend: &BackendId) -> Arc<BackendLimiter> {
        if let Some(limiter) = self.backends.get(backend) {
            return limiter.clone();
        }
        self.backends
            .entry(backend.clone())
            .or_insert_with(|| {
                Arc::new(BackendLimiter {
                    state: Mutex::new(RateWindow::new(self.config.default_limits)),
                    turn: Notify::new(),
                })
            })
            .clone()
    }

    /// Override limits for one backend
    ///
    /// A zero limit is treated as 1.
    pub fn set_limits(&self, backend: &BackendId, limits: RateLimits) {
        let limiter = self.limiter(backend);
        limiter.state.lock().limits = limits.normalized();
        limiter.turn.notify_waiters();
    }

    /// Check whether a call could proceed now, without recording it
    #[must_use]
    pub fn can_proceed(&self, backend: &BackendId) -> Admission {
        self.limiter(backend)
            .state
            .lock()
            .admission(Instant::now(), self.config.auto_throttle)
    }

    /// Wait for a slot, then record the call
    ///
    /// # Errors
    ///
    /// [`RateLimitError::QueueFull`] when too many callers are waiting, or
    /// [`RateLimitError::Timeout`] after `acquire_timeout`.
    pub async fn acquire(&self, backend: &BackendId) -> Result<(), RateLimitError> {
        let limiter = self.limiter(backend);
        let started = Instant::now();

        let ticket = {
            let mut state = limiter.state.lock();
            // Fast path: nobody waiting and a slot is free
            if state.waiting.is_empty()
                && state.admission(started, self.config.auto_throttle).is_allowed()
            {
                state.record(started);
                return Ok(());
            }
            if state.waiting.len() >= self.config.max_queue_size {
                tracing::warn!(
                    backend = %backend,
                    waiting = state.waiting.len(),
                    "Rate limit queue full"
                );
                return Err(RateLimitError::QueueFull {
                    backend: backend.clone(),
                    max: self.config.max_queue_size,
                });
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiting.push_back(ticket);
            state.throttled += 1;
            ticket
        };

        let mut guard = TicketGuard {
            limiter: &limiter,
            ticket,
            admitted: false,
        };

        let deadline = started + self.config.acquire_timeout;
        match tokio::time::timeout_at(deadline, self.wait_turn(&limiter, ticket)).await {
            Ok(()) => {
                guard.admitted = true;
                Ok(())
            }
            Err(_) => {
                let waited = started.elapsed();
                tracing::warn!(backend = %backend, ?waited, "Timed out waiting for rate limit");
                Err(RateLimitError::Timeout {
                    backend: backend.clone(),
                    waited,
                })
            }
        }
    }

    async fn wait_turn(&self, limiter: &BackendLimiter, ticket: u64) {
        loop {
            let notified = limiter.turn.notified();
            tokio::pin!(notified);

            let wait = {
                let mut state = limiter.state.lock();
                if state.waiting.front() == Some(&ticket) {
                    let now = Instant::now();
                    match state.admission(now, self.config.auto_throttle) {
                        Admission::Allowed => {
                            state.waiting.pop_front();
                            state.record(now);
                            drop(state);
                            limiter.turn.notify_waiters();
                            return;
                        }
                        Admission::Wait(d) => Some(d),
                    }
                } else {
                    None
                }
            };

            match wait {
                Some(delay) => {
                    tracing::trace!(delay_ms = delay.as_millis() as u64, "Throttling until slot frees");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Store a provider quota hint if it is newer than the current one
    pub fn update_from_hint(&self, backend: &BackendId, hint: QuotaHint) {
        if !self.config.auto_throttle {
            return;
        }
        let limiter = self.limiter(backend);
        {
            let mut state = limiter.state.lock();
            if state.hint.is_some_and(|h| h.observed_at > hint.observed_at) {
                return;
            }
            if hint.is_blocking(Instant::now()) {
                tracing::info!(
                    backend = %backend,
                    remaining = ?hint.remaining,
                    retry_after = ?hint.retry_after,
                    "Provider quota exhausted, throttling"
                );
            }
            state.hint = Some(hint);
        }
        limiter.turn.notify_waiters();
    }

    /// Parse and store quota headers
    pub fn update_from_headers<I, K, V>(&self, backend: &BackendId, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if let Some(hint) = QuotaHint::from_headers(headers) {
            self.update_from_hint(backend, hint);
        }
    }

    /// Statistics for one backend
    #[must_use]
    pub fn stats(&self, backend: &BackendId) -> RateLimiterStats {
        let limiter = self.limiter(backend);
        let mut state = limiter.state.lock();
        let now = Instant::now();
        state.prune(now);
        RateLimiterStats {
            backend: backend.clone(),
            limits: state.limits,
            requests_last_second: state.count_within(now, SECOND),
            requests_last_minute: state.count_within(now, MINUTE),
            waiting: state.waiting.len(),
            admitted_total: state.admitted,
            throttled_total: state.throttled,
            hint: state.hint,
        }
    }

    /// Forget recorded history and hints for one backend
    pub fn reset(&self, backend: &BackendId) {
        if let Some(limiter) = self.backends.get(backend).map(|l| l.clone()) {
            {
                let mut state = limiter.state.lock();
                state.timestamps.clear();
                state.hint = None;
            }
            limiter.turn.notify_waiters();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("backends", &self.backends.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> BackendId {
        BackendId::new("test", "model")
    }

    // =========================================================================
    // Configuration Tests
    // =========================================================================

    #[test]
    fn test_config_default() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.default_limits, RateLimits::default());
        assert!(config.auto_throttle);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_limits_builder_floor() {
        let limits = RateLimits::new().with_requests_per_second(0);
        assert_eq!(limits.requests_per_second, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limits_are_floored() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.set_limits(
            &b,
            RateLimits {
                requests_per_second: Some(0),
                requests_per_minute: Some(0),
            },
        );
        assert_eq!(
            limiter.stats(&b).limits,
            RateLimits {
                requests_per_second: Some(1),
                requests_per_minute: Some(1),
            }
        );

        assert!(limiter.can_proceed(&b).is_allowed());
        limiter.acquire(&b).await.unwrap();
        assert_eq!(limiter.can_proceed(&b).delay(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_quota_headers_do_not_block() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.update_from_headers(&b, [("retry-after", "inf"), ("x-ratelimit-reset", "NaN")]);
        assert!(limiter.can_proceed(&b).is_allowed());

        limiter.update_from_headers(&b, [("retry-after", "1e30")]);
        let wait = limiter.can_proceed(&b).delay().unwrap();
        assert!(wait <= crate::backend::MAX_HINT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_default_limits_are_floored() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_default_limits(RateLimits {
            requests_per_second: Some(0),
            requests_per_minute: None,
        }));
        let b = backend();
        limiter.acquire(&b).await.unwrap();
        assert_eq!(limiter.can_proceed(&b).delay(), Some(Duration::from_secs(1)));
    }

    // =========================================================================
    // Admission Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_always_allows() {
        let limiter = RateLimiter::default();
        for _ in 0..50 {
            limiter.acquire(&backend()).await.unwrap();
        }
        assert_eq!(limiter.stats(&backend()).requests_last_second, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_second_limit_blocks() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(2));

        limiter.acquire(&b).await.unwrap();
        limiter.acquire(&b).await.unwrap();
        match limiter.can_proceed(&b) {
            Admission::Wait(d) => assert_eq!(d, Duration::from_secs(1)),
            Admission::Allowed => panic!("third request should wait"),
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_proceed(&b).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_limit_blocks() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_default_limits(RateLimits::new().with_requests_per_minute(3)),
        );
        let b = backend();
        for _ in 0..3 {
            limiter.acquire(&b).await.unwrap();
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        // First admission was 15 s ago
        assert_eq!(limiter.can_proceed(&b), Admission::Wait(Duration::from_secs(45)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_hint_blocks_until_reset() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.update_from_hint(
            &b,
            QuotaHint::new()
                .with_remaining(0)
                .with_reset_in(Duration::from_secs(3)),
        );
        assert_eq!(limiter.can_proceed(&b), Admission::Wait(Duration::from_secs(3)));

        let start = Instant::now();
        limiter.acquire(&b).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_update_hint() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.update_from_headers(&b, [("X-RateLimit-Remaining", "0"), ("X-RateLimit-Reset", "2")]);
        assert!(!limiter.can_proceed(&b).is_allowed());
        assert_eq!(limiter.stats(&b).hint.unwrap().remaining, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_throttle_disabled_ignores_hints() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_auto_throttle(false));
        let b = backend();
        limiter.update_from_hint(
            &b,
            QuotaHint::new()
                .with_remaining(0)
                .with_reset_in(Duration::from_secs(30)),
        );
        assert!(limiter.can_proceed(&b).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_hint_does_not_replace_newer() {
        let limiter = RateLimiter::default();
        let b = backend();
        let old = QuotaHint::new().with_remaining(0).with_reset_in(Duration::from_secs(30));
        tokio::time::advance(Duration::from_millis(10)).await;
        let new = QuotaHint::new().with_remaining(50);

        limiter.update_from_hint(&b, new);
        limiter.update_from_hint(&b, old);
        assert_eq!(limiter.stats(&b).hint.unwrap().remaining, Some(50));
    }

    // =========================================================================
    // Queueing Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_queued_callers_complete_after_window_rolls() {
        let limiter = Arc::new(RateLimiter::default());
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(2));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&b).await.unwrap();
                start.elapsed()
            }));
        }

        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();

        // Never more than 2 admissions in any 1 s window
        for (i, t) in times.iter().enumerate() {
            let in_window = times[i..].iter().filter(|u| **u - *t < SECOND).count();
            assert!(in_window <= 2, "window starting at {t:?} admitted {in_window}");
        }
        assert_eq!(times[4], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let limiter = Arc::new(RateLimiter::default());
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(1));
        limiter.acquire(&b).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&b).await.unwrap();
                order.lock().push(i);
            }));
            // Let each task enqueue before spawning the next
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new().with_max_queue_size(1)));
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(1));
        limiter.acquire(&b).await.unwrap();

        let waiting = {
            let limiter = Arc::clone(&limiter);
            let b = b.clone();
            tokio::spawn(async move { limiter.acquire(&b).await })
        };
        tokio::task::yield_now().await;

        let err = limiter.acquire(&b).await.unwrap_err();
        assert!(matches!(err, RateLimitError::QueueFull { max: 1, .. }));
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new().with_acquire_timeout(Duration::from_millis(500)),
        );
        let b = backend();
        limiter.update_from_hint(
            &b,
            QuotaHint::new()
                .with_remaining(0)
                .with_reset_in(Duration::from_secs(10)),
        );

        let err = limiter.acquire(&b).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert_eq!(limiter.stats(&b).waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_releases_queue_position() {
        let limiter = Arc::new(RateLimiter::default());
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(1));
        limiter.acquire(&b).await.unwrap();

        let abandoned = {
            let limiter = Arc::clone(&limiter);
            let b = b.clone();
            tokio::spawn(async move { limiter.acquire(&b).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.stats(&b).waiting, 1);
        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(limiter.stats(&b).waiting, 0);

        tokio::time::advance(SECOND).await;
        limiter.acquire(&b).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backends_are_independent() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::new().with_default_limits(RateLimits::new().with_requests_per_second(1)),
        ));
        let a = BackendId::new("p", "a");
        let c = BackendId::new("p", "c");
        limiter.acquire(&a).await.unwrap();

        let admitted = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        limiter.acquire(&c).await.unwrap();
        admitted.fetch_add(1, Ordering::SeqCst);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_reset() {
        let limiter = RateLimiter::default();
        let b = backend();
        limiter.set_limits(&b, RateLimits::new().with_requests_per_second(1));
        limiter.acquire(&b).await.unwrap();
        limiter.acquire(&b).await.unwrap();

        let stats = limiter.stats(&b);
        assert_eq!(stats.admitted_total, 2);
        assert_eq!(stats.throttled_total, 1);
        assert_eq!(stats.requests_last_second, 1);
        assert_eq!(stats.requests_last_minute, 2);

        limiter.reset(&b);
        assert_eq!(limiter.stats(&b).requests_last_minute, 0);
        assert!(limiter.can_proceed(&b).is_allowed());
    }

    #[test]
    fn test_error_display() {
        let err = RateLimitError::QueueFull {
            backend: backend(),
            max: 3,
        };
        assert_eq!(err.to_string(), "rate limit queue full for test/model (3 waiting)");
    }
}
