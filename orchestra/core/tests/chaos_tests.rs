//! Chaos tests for the orchestration pipeline
//!
//! Each scenario injects a failure mode into the executor and checks that the
//! orchestrator degrades the way it should: nothing hangs, bookkeeping stays
//! consistent, and unhealthy backends are isolated.
//!
//! All scenarios run on paused time, so timeouts and backoff are simulated.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use orchestra_core::backend::TokenUsage;
use orchestra_core::resilience::{
    CircuitBreakerConfig, CircuitEventKind, EnqueueOptions, QueueConfig, QueueError,
};
use orchestra_core::{
    BackendError, BackendId, CircuitState, FnExecutor, ModelDefinition, ModelRegistry,
    OrchestraError, Orchestrator, QuotaHint, RequestEnvelope, ResponseEnvelope, RetryConfig,
    Subsystem,
};

fn id(model: &str) -> BackendId {
    BackendId::new("chaos", model)
}

fn registry(models: &[&str]) -> Arc<ModelRegistry> {
    let registry = ModelRegistry::new();
    for name in models {
        registry.register(ModelDefinition::new(id(name)).with_pricing(0.001, 0.001));
    }
    Arc::new(registry)
}

// =============================================================================
// Chaos 1: Backend Hangs
// =============================================================================

/// A backend that never answers must not pin queue slots forever.
///
/// Setup: one slot for `slow`, executor never returns for it.
/// Pass: the queued call times out, the slot is freed, the next call to a
/// healthy backend completes, and stats show exactly one timeout.
#[tokio::test(start_paused = true)]
async fn chaos_backend_hang() {
    let orchestrator = Orchestrator::builder()
        .registry(registry(&["slow", "fast"]))
        .retry(RetryConfig::no_retry())
        .queue(QueueConfig::new().with_max_concurrency(1))
        .executor(FnExecutor::new(|backend: BackendId, _request: RequestEnvelope| async move {
            if backend.model() == "slow" {
                std::future::pending::<()>().await;
            }
            Ok(ResponseEnvelope::new(backend, "ok"))
        }))
        .build()
        .unwrap();

    let err = assert_err!(
        orchestrator
            .enqueue(
                id("slow"),
                RequestEnvelope::user("hello?"),
                EnqueueOptions::default().with_timeout(Duration::from_millis(200)),
            )
            .await
    );
    assert!(matches!(err, OrchestraError::Queue(QueueError::Timeout { .. })));

    // The hung call no longer holds the only slot, so the retry is admitted
    // (and hangs in turn)
    let again = orchestrator
        .enqueue(
            id("slow"),
            RequestEnvelope::user("again"),
            EnqueueOptions::default().with_timeout(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(
        again,
        Err(OrchestraError::Queue(QueueError::Timeout { .. }))
    ));

    assert_ok!(
        orchestrator
            .enqueue(id("fast"), RequestEnvelope::user("hi"), EnqueueOptions::default())
            .await
    );

    let stats = orchestrator.queue_stats();
    assert_eq!(stats.timed_out, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(orchestrator.metrics().queue_rejections, 2);
}

// =============================================================================
// Chaos 2: Failure Storm Trips The Circuit Once
// =============================================================================

/// Many concurrent callers hitting a dead backend open its circuit, and the
/// rest are rejected without reaching it.
#[tokio::test(start_paused = true)]
async fn chaos_concurrent_failure_storm() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let orchestrator = Orchestrator::builder()
        .registry(registry(&["dead"]))
        .retry(RetryConfig::no_retry())
        .circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(5))
        .executor(FnExecutor::new(move |_backend: BackendId, _request: RequestEnvelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::network("connection reset")) }
        }))
        .build()
        .unwrap();
    let mut events = orchestrator.circuit_breaker().subscribe();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .execute(&id("dead"), &RequestEnvelope::user("x"))
                    .await
            })
        })
        .collect();

    let mut rejected = 0;
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        if err.subsystem() == Subsystem::CircuitBreaker {
            rejected += 1;
        }
    }

    let executed = calls.load(Ordering::SeqCst);
    assert!(executed >= 5);
    assert_eq!(executed + rejected, 20);
    assert_eq!(orchestrator.circuit_state(&id("dead")), CircuitState::Open);

    let mut opened = 0;
    loop {
        match events.try_recv() {
            Ok(event) => {
                if matches!(event.kind, CircuitEventKind::Opened { .. }) {
                    opened += 1;
                }
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
    assert_eq!(opened, 1);
}

// =============================================================================
// Chaos 3: Provider Quota Exhaustion
// =============================================================================

/// A 429 carrying `retry-after` throttles the backend for that long.
#[tokio::test(start_paused = true)]
async fn chaos_quota_exhaustion_throttles() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let orchestrator = Orchestrator::builder()
        .registry(registry(&["busy"]))
        .retry(RetryConfig::no_retry())
        .executor(FnExecutor::new(move |backend: BackendId, _request: RequestEnvelope| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BackendError::rate_limited("slow down")
                        .with_quota(QuotaHint::new().with_retry_after(Duration::from_secs(2))))
                } else {
                    Ok(ResponseEnvelope::new(backend, "ok"))
                }
            }
        }))
        .build()
        .unwrap();

    let err = assert_err!(orchestrator.execute(&id("busy"), &RequestEnvelope::user("a")).await);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

    let started = Instant::now();
    assert_ok!(orchestrator.execute(&id("busy"), &RequestEnvelope::user("b")).await);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Chaos 4: Flapping Backend Under Load
// =============================================================================

/// One of two backends fails every other call while many chats run at once.
///
/// Pass: every chat succeeds (the healthy backend absorbs failures), the
/// queue drains completely, and per-backend counters add up.
#[tokio::test(start_paused = true)]
async fn chaos_flapping_backend_under_load() {
    let flips = Arc::new(AtomicU64::new(0));
    let flip = Arc::clone(&flips);
    let orchestrator = Orchestrator::builder()
        .registry(registry(&["flaky", "steady"]))
        .retry(RetryConfig::no_retry())
        .circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(1000))
        .queue(QueueConfig::new().with_max_concurrency(3))
        .executor(FnExecutor::new(move |backend: BackendId, _request: RequestEnvelope| {
            let fail = backend.model() == "flaky" && flip.fetch_add(1, Ordering::SeqCst) % 2 == 0;
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if fail {
                    Err(BackendError::server("flap"))
                } else {
                    Ok(ResponseEnvelope::new(backend, "ok").with_usage(TokenUsage::new(10, 10)))
                }
            }
        }))
        .build()
        .unwrap();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .chat(&RequestEnvelope::user(format!("request {i}")), None)
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.successes, 40);
    assert_eq!(metrics.requests, metrics.successes + metrics.failures);
    assert_eq!(metrics.queue_pending, 0);
    assert_eq!(metrics.queue_processing, 0);
    assert_eq!(orchestrator.queue_stats().failed, metrics.failures);
}
