//! Retry policy with exponential backoff
//!
//! Wraps a single backend call with a bounded number of retries. Failures are
//! classified by [`ErrorKind`]; only transient kinds listed in
//! [`RetryConfig::retry_on`] are retried, everything else propagates on the
//! first attempt.
//!
//! Backoff for retry `i` (0-indexed):
//!
//! ```text
//! delay = min(base_delay * backoff_multiplier^i, max_delay)
//! delay = delay * uniform(0.5, 1.5)        // when jitter is enabled
//! ```
//!
//! A call is made at most `max_retries + 1` times.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::backend::{BackendError, ErrorKind};

// ============================================================================
// Configuration
// ============================================================================

/// Retry configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,

    /// Growth factor per retry
    pub backoff_multiplier: f64,

    /// Multiply delays by a random factor in `[0.5, 1.5]`
    pub jitter: bool,

    /// Error kinds that may be retried
    pub retry_on: Vec<ErrorKind>,

    /// Wait at least as long as a provider `retry-after` hint
    pub honor_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on: vec![
                ErrorKind::RateLimit,
                ErrorKind::Timeout,
                ErrorKind::ServerError,
                ErrorKind::NetworkError,
            ],
            honor_retry_after: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryable kinds
    #[must_use]
    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Configuration that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `attempt` (0-indexed)
    #[must_use]
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry `attempt` (0-indexed), jitter applied
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    /// Whether an error of `kind` may be retried
    #[must_use]
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind.is_transient() && self.retry_on.contains(&kind)
    }
}

// ============================================================================
// Metadata & Errors
// ============================================================================

/// Retry history attached to a response when at least one retry happened
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total calls made, including the first
    pub attempts: u32,

    /// Delay slept before each retry
    pub delays: Vec<Duration>,

    /// Time from the first call to the final outcome
    pub total_elapsed: Duration,

    /// Message of the last error seen
    pub last_error: Option<String>,
}

impl RetryMetadata {
    /// Retries performed (attempts after the first)
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// The call failed and will not be retried further
#[derive(Clone, Debug, Error)]
#[error("{error} (after {} attempt(s))", .metadata.attempts)]
pub struct RetryError {
    /// Final error
    pub error: BackendError,

    /// True when the budget ran out; false when the error was not retryable
    pub exhausted: bool,

    /// Retry history
    pub metadata: RetryMetadata,
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Overrides the retry decision: `(error, attempt) -> retry?`
pub type RetryPredicate = Arc<dyn Fn(&BackendError, u32) -> bool + Send + Sync>;

/// Called before each retry sleep: `(error, retry_number, delay)`
pub type RetryObserver = Arc<dyn Fn(&BackendError, u32, Duration) + Send + Sync>;

/// Retry policy: configuration plus optional hooks
#[derive(Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
    should_retry: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Create a policy from configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Replace the retry decision entirely
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BackendError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Observe retries
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&BackendError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Same hooks, different retry budget
    #[must_use]
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        let mut policy = self.clone();
        policy.config.max_retries = max_retries;
        policy
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, error: &BackendError, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => self.config.is_retryable(error.kind),
        }
    }

    fn delay_for(&self, error: &BackendError, attempt: u32) -> Duration {
        let delay = self.config.backoff_for_attempt(attempt);
        if !self.config.honor_retry_after {
            return delay;
        }
        match error.quota.and_then(|q| q.retry_after) {
            Some(hint) => delay.max(hint.min(self.config.max_delay)),
            None => delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out
    ///
    /// `op` receives the 0-indexed attempt number. Metadata is returned only
    /// when at least one retry happened.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] with the last error and the retry history.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<(T, Option<RetryMetadata>), RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();
        let mut delays = Vec::new();
        let mut last_error = None;
        let mut attempt = 0u32;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    let metadata = (attempt > 0).then(|| RetryMetadata {
                        attempts: attempt + 1,
                        delays,
                        total_elapsed: start.elapsed(),
                        last_error,
                    });
                    return Ok((value, metadata));
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    let retryable = self.should_retry(&error, attempt);

                    if !retryable || attempt >= self.config.max_retries {
                        if retryable {
                            tracing::warn!(
                                kind = %error.kind,
                                attempts = attempt + 1,
                                "Retry budget exhausted"
                            );
                        } else {
                            tracing::debug!(kind = %error.kind, "Error is not retryable");
                        }
                        return Err(RetryError {
                            error,
                            exhausted: retryable,
                            metadata: RetryMetadata {
                                attempts: attempt + 1,
                                delays,
                                total_elapsed: start.elapsed(),
                                last_error,
                            },
                        });
                    }

                    let delay = self.delay_for(&error, attempt);
                    if let Some(observer) = &self.on_retry {
                        observer(&error, attempt + 1, delay);
                    }
                    tracing::debug!(
                        kind = %error.kind,
                        retry = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_predicate", &self.should_retry.is_some())
            .field("has_observer", &self.on_retry.is_some())
            .finish()
    }
}

/// Run `op` under a policy built from `config`
///
/// # Errors
///
/// See [`RetryPolicy::run`].
pub async fn with_retry<T, F, Fut>(
    config: RetryConfig,
    op: F,
) -> Result<(T, Option<RetryMetadata>), RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    RetryPolicy::new(config).run(op).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QuotaHint;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter(false)
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.jitter);
        assert!(config.is_retryable(ErrorKind::RateLimit));
        assert!(!config.is_retryable(ErrorKind::ServiceUnavailable));
        assert!(!config.is_retryable(ErrorKind::Auth));
    }

    #[test]
    fn test_base_backoff_grows_and_caps() {
        let config = fast_config();
        assert_eq!(config.base_backoff(0), Duration::from_millis(100));
        assert_eq!(config.base_backoff(1), Duration::from_millis(200));
        assert_eq!(config.base_backoff(3), Duration::from_millis(800));
        assert_eq!(config.base_backoff(4), Duration::from_millis(1000));
        assert_eq!(config.base_backoff(30), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = fast_config().with_jitter(true);
        for attempt in 0..5 {
            let base = config.base_backoff(attempt);
            for _ in 0..50 {
                let delay = config.backoff_for_attempt(attempt);
                assert!(delay >= base.mul_f64(0.5), "{delay:?} < half of {base:?}");
                assert!(delay <= base.mul_f64(1.5), "{delay:?} > 1.5x {base:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try_has_no_metadata() {
        let (value, metadata) = with_retry(fast_config(), |_| async { Ok::<_, BackendError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(metadata.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let calls = AtomicU32::new(0);
        let config = fast_config().with_max_retries(2);

        let err = with_retry(config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BackendError::server("boom")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.exhausted);
        assert_eq!(err.metadata.attempts, 3);
        assert_eq!(
            err.metadata.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_retry(fast_config(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BackendError::auth("bad key")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.exhausted);
        assert!(err.metadata.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries_carries_metadata() {
        let (value, metadata) = with_retry(fast_config(), |attempt| async move {
            if attempt < 2 {
                Err(BackendError::timeout("slow"))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        let metadata = metadata.unwrap();
        assert_eq!(metadata.attempts, 3);
        assert_eq!(metadata.retries(), 2);
        assert_eq!(metadata.total_elapsed, Duration::from_millis(300));
        assert!(metadata.last_error.unwrap().contains("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_overrides_decision() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(fast_config()).with_predicate(|err, _| err.kind == ErrorKind::Auth);

        let _ = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::auth("rotate key")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        calls.store(0, Ordering::SeqCst);
        let _ = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::server("boom")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let policy = RetryPolicy::new(fast_config().with_max_retries(2))
            .with_observer(move |err, n, delay| sink.lock().push((err.kind, n, delay)));

        let _ = policy
            .run(|_| async { Err::<(), _>(BackendError::network("reset")) })
            .await;

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (ErrorKind::NetworkError, 1, Duration::from_millis(100)),
                (ErrorKind::NetworkError, 2, Duration::from_millis(200)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_delay() {
        let policy = RetryPolicy::new(fast_config().with_max_retries(1));
        let err = policy
            .run(|_| async {
                Err::<(), _>(
                    BackendError::rate_limited("slow down")
                        .with_quota(QuotaHint::new().with_retry_after(Duration::from_millis(700))),
                )
            })
            .await
            .unwrap_err();
        assert_eq!(err.metadata.delays, vec![Duration::from_millis(700)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries() {
        let calls = AtomicU32::new(0);
        let _ = with_retry(RetryConfig::no_retry(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BackendError::server("boom")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_display() {
        let err = RetryError {
            error: BackendError::server("boom"),
            exhausted: true,
            metadata: RetryMetadata {
                attempts: 3,
                ..Default::default()
            },
        };
        assert_eq!(err.to_string(), "server_error (HTTP 500): boom (after 3 attempt(s))");
    }
}
