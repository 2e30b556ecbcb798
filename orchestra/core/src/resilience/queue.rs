//! Priority Request Queue
//!
//! Admission control in front of the backends: one waiting list ordered by
//! priority tier (FIFO within a tier) and a per-backend concurrency budget.
//!
//! # Architecture
//!
//! ```text
//!   enqueue(backend, request)
//!            │
//!            v
//!   ┌──────────────────────────────┐
//!   │ waiting: [High.. Normal.. Low..] │   scan for first entry whose
//!   └──────────────┬───────────────┘   backend is under its cap
//!                  │ admit
//!                  v
//!   ┌──────────────────────────────┐
//!   │ processing (spawned handler) │── complete / fail ──┐
//!   └──────────────────────────────┘                     │
//!                  ^                                     │
//!                  └──────── release slot, admit next ───┘
//! ```
//!
//! Admission is event driven: it runs when an entry arrives and whenever an
//! entry leaves processing. Nothing polls.
//!
//! Every entry has its own deadline. When it fires the entry is removed from
//! wherever it is, its slot (if any) is freed, and the caller receives
//! [`QueueError::Timeout`]. A handler already running is left to finish; its
//! result is discarded.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backend::{BackendExecutor, BackendId, Priority, RequestEnvelope, ResponseEnvelope};

// ============================================================================
// Configuration
// ============================================================================

/// Request queue configuration
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// Concurrent requests per backend unless overridden
    pub max_concurrency: usize,

    /// Priority for requests that do not set one
    pub default_priority: Priority,

    /// Deadline for requests that do not set one
    pub timeout: Duration,

    /// Maximum waiting entries across all backends
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_priority: Priority::Normal,
            timeout: Duration::from_millis(60_000),
            max_queue_size: 1000,
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-backend concurrency cap
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the default priority
    #[must_use]
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set the default timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the waiting-list cap
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }
}

/// Per-call options for [`RequestQueue::enqueue`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Priority tier; falls back to the request's, then the queue default
    pub priority: Option<Priority>,

    /// Deadline; falls back to the request's, then the queue default
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    /// Options with a priority
    #[must_use]
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            timeout: None,
        }
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Where an entry was when its deadline fired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStage {
    /// Still waiting for a slot
    Waiting,
    /// Admitted and running
    Processing,
}

/// Queue outcome errors
#[derive(Debug, Error)]
pub enum QueueError<E> {
    /// The waiting list is at capacity
    #[error("request queue full ({max} waiting)")]
    Full {
        /// Configured cap
        max: usize,
    },

    /// The entry's deadline fired
    #[error("request to {backend} timed out after {waited:?} while {stage:?}")]
    Timeout {
        /// Target backend
        backend: BackendId,
        /// Time since enqueue
        waited: Duration,
        /// Where the entry was
        stage: QueueStage,
    },

    /// The entry was removed by [`RequestQueue::clear`]
    #[error("request cancelled")]
    Cancelled,

    /// The handler ran and failed
    #[error("{0}")]
    Failed(E),
}

impl<E> QueueError<E> {
    /// True for admission failures (full, timeout, cancelled)
    #[must_use]
    pub fn is_admission(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    /// Split the handler's error from admission failures
    ///
    /// # Errors
    ///
    /// Returns the admission failure, retyped so it carries no handler error.
    pub fn into_failure(self) -> Result<E, QueueError<Infallible>> {
        match self {
            Self::Failed(e) => Ok(e),
            Self::Full { max } => Err(QueueError::Full { max }),
            Self::Timeout {
                backend,
                waited,
                stage,
            } => Err(QueueError::Timeout {
                backend,
                waited,
                stage,
            }),
            Self::Cancelled => Err(QueueError::Cancelled),
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Work run for each admitted entry
pub type QueueHandler<E> =
    Arc<dyn Fn(BackendId, RequestEnvelope) -> BoxFuture<'static, Result<ResponseEnvelope, E>> + Send + Sync>;

type Outcome<E> = Result<ResponseEnvelope, QueueError<E>>;

// ============================================================================
// Queue State
// ============================================================================

struct QueueEntry<E> {
    id: u64,
    backend: BackendId,
    request: RequestEnvelope,
    priority: Priority,
    enqueued_at: Instant,
    reply: oneshot::Sender<Outcome<E>>,
}

struct InFlight<E> {
    backend: BackendId,
    reply: oneshot::Sender<Outcome<E>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Counters {
    completed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
}

struct QueueState<E> {
    waiting: VecDeque<QueueEntry<E>>,
    processing: HashMap<u64, InFlight<E>>,
    in_flight: HashMap<BackendId, usize>,
    limits: HashMap<BackendId, usize>,
    totals: Counters,
    per_backend: HashMap<BackendId, Counters>,
    admitted: u64,
    total_wait: Duration,
    next_id: u64,
}

impl<E> QueueState<E> {
    fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            processing: HashMap::new(),
            in_flight: HashMap::new(),
            limits: HashMap::new(),
            totals: Counters::default(),
            per_backend: HashMap::new(),
            admitted: 0,
            total_wait: Duration::ZERO,
            next_id: 0,
        }
    }

    /// Insert behind every entry of equal or higher urgency
    fn insert(&mut self, entry: QueueEntry<E>) {
        let pos = self
            .waiting
            .iter()
            .position(|e| e.priority > entry.priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, entry);
    }

    fn release(&mut self, backend: &BackendId) {
        if let Some(n) = self.in_flight.get_mut(backend) {
            *n = n.saturating_sub(1);
        }
    }

    fn count(&mut self, backend: &BackendId, f: impl Fn(&mut Counters)) {
        f(&mut self.totals);
        f(self.per_backend.entry(backend.clone()).or_default());
    }
}

struct Inner<E> {
    config: QueueConfig,
    handler: QueueHandler<E>,
    state: Mutex<QueueState<E>>,
}

impl<E: Send + 'static> Inner<E> {
    fn cap(&self, state: &QueueState<E>, backend: &BackendId) -> usize {
        state
            .limits
            .get(backend)
            .copied()
            .unwrap_or(self.config.max_concurrency)
    }

    /// Admit every waiting entry whose backend has a free slot
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut i = 0;
            while i < state.waiting.len() {
                let backend = &state.waiting[i].backend;
                let running = state.in_flight.get(backend).copied().unwrap_or(0);
                if running >= self.cap(&state, backend) {
                    i += 1;
                    continue;
                }
                let Some(entry) = state.waiting.remove(i) else {
                    break;
                };
                *state.in_flight.entry(entry.backend.clone()).or_insert(0) += 1;
                state.admitted += 1;
                state.total_wait += now.duration_since(entry.enqueued_at);
                state.processing.insert(
                    entry.id,
                    InFlight {
                        backend: entry.backend.clone(),
                        reply: entry.reply,
                    },
                );
                started.push((entry.id, entry.backend, entry.request));
            }
        }

        for (id, backend, request) in started {
            tracing::trace!(backend = %backend, entry = id, "Admitted queued request");
            let work = (self.handler)(backend, request);
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let result = work.await;
                inner.finish(id, result);
            });
        }
    }

    fn finish(self: &Arc<Self>, id: u64, result: Result<ResponseEnvelope, E>) {
        let reply = {
            let mut state = self.state.lock();
            match state.processing.remove(&id) {
                Some(flight) => {
                    state.release(&flight.backend);
                    let ok = result.is_ok();
                    state.count(&flight.backend, |c| {
                        if ok {
                            c.completed += 1;
                        } else {
                            c.failed += 1;
                        }
                    });
                    Some(flight.reply)
                }
                // Entry timed out while running
                None => None,
            }
        };

        match reply {
            Some(reply) => {
                let _ = reply.send(result.map_err(QueueError::Failed));
            }
            None => tracing::debug!(entry = id, "Discarding result of timed-out request"),
        }
        self.pump();
    }

    /// Remove an entry whose deadline fired; false if it already settled
    fn expire(self: &Arc<Self>, id: u64) -> Option<QueueStage> {
        let stage = {
            let mut state = self.state.lock();
            if let Some(pos) = state.waiting.iter().position(|e| e.id == id) {
                if let Some(entry) = state.waiting.remove(pos) {
                    state.count(&entry.backend, |c| c.timed_out += 1);
                }
                Some(QueueStage::Waiting)
            } else if let Some(flight) = state.processing.remove(&id) {
                state.release(&flight.backend);
                state.count(&flight.backend, |c| c.timed_out += 1);
                Some(QueueStage::Processing)
            } else {
                None
            }
        };
        if stage == Some(QueueStage::Processing) {
            self.pump();
        }
        stage
    }

    /// Remove an entry whose caller went away
    fn abandon(self: &Arc<Self>, id: u64) {
        let freed = {
            let mut state = self.state.lock();
            if let Some(pos) = state.waiting.iter().position(|e| e.id == id) {
                if let Some(entry) = state.waiting.remove(pos) {
                    state.count(&entry.backend, |c| c.cancelled += 1);
                }
                false
            } else if let Some(flight) = state.processing.remove(&id) {
                state.release(&flight.backend);
                state.count(&flight.backend, |c| c.cancelled += 1);
                true
            } else {
                false
            }
        };
        if freed {
            self.pump();
        }
    }
}

/// Settles an entry as cancelled if the caller's future is dropped
struct EntryGuard<'a, E: Send + 'static> {
    inner: &'a Arc<Inner<E>>,
    id: u64,
    settled: bool,
}

impl<E: Send + 'static> Drop for EntryGuard<'_, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon(self.id);
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Per-backend queue statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendQueueStats {
    /// Waiting entries
    pub pending: usize,
    /// Running entries
    pub processing: usize,
    /// Concurrency cap
    pub max_concurrency: usize,
    /// Completed successfully
    pub completed: u64,
    /// Handler failed
    pub failed: u64,
    /// Deadline fired
    pub timed_out: u64,
    /// Cleared or abandoned
    pub cancelled: u64,
}

/// Queue statistics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueStats {
    /// Waiting entries
    pub pending: usize,
    /// Running entries
    pub processing: usize,
    /// Completed successfully
    pub completed: u64,
    /// Handler failed
    pub failed: u64,
    /// Deadline fired
    pub timed_out: u64,
    /// Cleared or abandoned
    pub cancelled: u64,
    /// Mean time from enqueue to admission
    pub average_wait: Duration,
    /// Breakdown per backend
    pub per_backend: HashMap<BackendId, BackendQueueStats>,
}

// ============================================================================
// Request Queue
// ============================================================================

/// Priority queue with per-backend concurrency caps
pub struct RequestQueue<E = crate::backend::BackendError> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for RequestQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + 'static> RequestQueue<E> {
    /// Create a queue that runs `handler` for each admitted entry
    #[must_use]
    pub fn new(config: QueueConfig, handler: QueueHandler<E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(QueueState::new()),
            }),
        }
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Override the concurrency cap for one backend
    pub fn set_max_concurrency(&self, backend: &BackendId, max: usize) {
        self.inner
            .state
            .lock()
            .limits
            .insert(backend.clone(), max.max(1));
        self.inner.pump();
    }

    /// Queue a request and wait for its outcome
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`], [`QueueError::Timeout`], [`QueueError::Cancelled`]
    /// for admission failures, or [`QueueError::Failed`] with the handler's
    /// error.
    pub async fn enqueue(
        &self,
        backend: BackendId,
        request: RequestEnvelope,
        options: EnqueueOptions,
    ) -> Result<ResponseEnvelope, QueueError<E>> {
        let config = &self.inner.config;
        let priority = options
            .priority
            .or(request.priority)
            .unwrap_or(config.default_priority);
        let timeout = options.timeout.or(request.timeout).unwrap_or(config.timeout);
        let enqueued_at = Instant::now();
        let (reply, mut outcome) = oneshot::channel();

        let id = {
            let mut state = self.inner.state.lock();
            if state.waiting.len() >= config.max_queue_size {
                tracing::warn!(backend = %backend, waiting = state.waiting.len(), "Request queue full");
                return Err(QueueError::Full {
                    max: config.max_queue_size,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.insert(QueueEntry {
                id,
                backend: backend.clone(),
                request,
                priority,
                enqueued_at,
                reply,
            });
            id
        };

        let mut guard = EntryGuard {
            inner: &self.inner,
            id,
            settled: false,
        };
        self.inner.pump();

        let result = match tokio::time::timeout_at(enqueued_at + timeout, &mut outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(QueueError::Cancelled),
            Err(_) => match self.inner.expire(id) {
                Some(stage) => {
                    tracing::warn!(backend = %backend, ?stage, ?timeout, "Queued request timed out");
                    Err(QueueError::Timeout {
                        backend,
                        waited: enqueued_at.elapsed(),
                        stage,
                    })
                }
                // Settled between the deadline and the lock
                None => outcome.try_recv().unwrap_or(Err(QueueError::Cancelled)),
            },
        };
        guard.settled = true;
        result
    }

    /// Reject every waiting entry with [`QueueError::Cancelled`]
    ///
    /// Running entries are unaffected. Returns the number cleared.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueueEntry<E>> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<_> = state.waiting.drain(..).collect();
            for entry in &drained {
                state.count(&entry.backend, |c| c.cancelled += 1);
            }
            drained
        };
        let n = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(QueueError::Cancelled));
        }
        if n > 0 {
            tracing::info!(cleared = n, "Request queue cleared");
        }
        n
    }

    /// Waiting entries
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Running entries
    #[must_use]
    pub fn processing(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    /// Running entries for one backend
    #[must_use]
    pub fn in_flight(&self, backend: &BackendId) -> usize {
        self.inner
            .state
            .lock()
            .in_flight
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of queue statistics
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let mut per_backend: HashMap<BackendId, BackendQueueStats> = HashMap::new();

        for (backend, counters) in &state.per_backend {
            let entry = per_backend.entry(backend.clone()).or_default();
            entry.completed = counters.completed;
            entry.failed = counters.failed;
            entry.timed_out = counters.timed_out;
            entry.cancelled = counters.cancelled;
        }
        for entry in &state.waiting {
            per_backend.entry(entry.backend.clone()).or_default().pending += 1;
        }
        for flight in state.processing.values() {
            per_backend.entry(flight.backend.clone()).or_default().processing += 1;
        }
        for (backend, stats) in &mut per_backend {
            stats.max_concurrency = self.inner.cap(&state, backend);
        }

        let average_wait = if state.admitted == 0 {
            Duration::ZERO
        } else {
            state.total_wait / u32::try_from(state.admitted).unwrap_or(u32::MAX)
        };

        QueueStats {
            pending: state.waiting.len(),
            processing: state.processing.len(),
            completed: state.totals.completed,
            failed: state.totals.failed,
            timed_out: state.totals.timed_out,
            cancelled: state.totals.cancelled,
            average_wait,
            per_backend,
        }
    }
}

impl RequestQueue<crate::backend::BackendError> {
    /// Queue that calls an executor directly
    #[must_use]
    pub fn for_executor(config: QueueConfig, executor: Arc<dyn BackendExecutor>) -> Self {
        let handler: QueueHandler<crate::backend::BackendError> =
            Arc::new(move |backend, request| {
                let executor = Arc::clone(&executor);
                Box::pin(async move { executor.execute(&backend, &request).await })
            });
        Self::new(config, handler)
    }
}

impl<E> std::fmt::Debug for RequestQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> BackendId {
        BackendId::new("test", "model")
    }

    /// Let spawned tasks run up to their next timer
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Handler that sleeps, tracks peak concurrency, and logs start order
    struct Probe {
        active: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    fn probe_queue(config: QueueConfig, work: Duration) -> (RequestQueue, Arc<Probe>) {
        let probe = Arc::new(Probe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        });
        let p = Arc::clone(&probe);
        let handler: QueueHandler<BackendError> = Arc::new(move |backend, request| {
            let p = Arc::clone(&p);
            Box::pin(async move {
                let now = p.active.fetch_add(1, Ordering::SeqCst) + 1;
                p.peak.fetch_max(now, Ordering::SeqCst);
                p.order.lock().push(request.messages[0].content.clone());
                tokio::time::sleep(work).await;
                p.active.fetch_sub(1, Ordering::SeqCst);
                if request.messages[0].content == "fail" {
                    Err(BackendError::server("boom"))
                } else {
                    Ok(ResponseEnvelope::new(backend, "ok"))
                }
            })
        });
        (RequestQueue::new(config, handler), probe)
    }

    #[test]
    fn test_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.default_priority, Priority::Normal);
        assert_eq!(config.timeout, Duration::from_millis(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_completes() {
        let (queue, _) = probe_queue(QueueConfig::default(), Duration::from_millis(10));
        let response = queue
            .enqueue(backend(), RequestEnvelope::user("hi"), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_and_priority_order() {
        let (queue, probe) = probe_queue(
            QueueConfig::default().with_max_concurrency(2),
            Duration::from_millis(100),
        );

        let submissions = [
            ("r0", Priority::Normal),
            ("r1", Priority::Normal),
            ("r2", Priority::Low),
            ("r3", Priority::High),
            ("r4", Priority::Normal),
        ];
        let mut handles = Vec::new();
        for (name, priority) in submissions {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user(name), EnqueueOptions::priority(priority))
                    .await
            }));
            settle().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
        assert_eq!(*probe.order.lock(), vec!["r0", "r1", "r3", "r4", "r2"]);
        assert_eq!(queue.stats().completed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backends_have_independent_slots() {
        let (queue, probe) = probe_queue(
            QueueConfig::default().with_max_concurrency(1),
            Duration::from_millis(100),
        );
        let a = BackendId::new("p", "a");
        let b = BackendId::new("p", "b");

        let start = Instant::now();
        let (ra, rb) = tokio::join!(
            queue.enqueue(a, RequestEnvelope::user("a"), EnqueueOptions::default()),
            queue.enqueue(b, RequestEnvelope::user("b"), EnqueueOptions::default()),
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_waiting() {
        let (queue, _) = probe_queue(
            QueueConfig::default().with_max_concurrency(1),
            Duration::from_secs(10),
        );
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user("slow"), EnqueueOptions::default())
                    .await
            })
        };
        settle().await;

        let err = queue
            .enqueue(
                backend(),
                RequestEnvelope::user("late"),
                EnqueueOptions::default().with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Timeout {
                stage: QueueStage::Waiting,
                ..
            }
        ));
        assert_eq!(queue.stats().timed_out, 1);
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_processing_frees_slot() {
        let (queue, probe) = probe_queue(
            QueueConfig::default().with_max_concurrency(1),
            Duration::from_secs(10),
        );

        let err = queue
            .enqueue(
                backend(),
                RequestEnvelope::user("stuck"),
                EnqueueOptions::default().with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Timeout {
                stage: QueueStage::Processing,
                ..
            }
        ));
        assert_eq!(queue.in_flight(&backend()), 0);

        // The slot is free even though the first handler is still running
        let next = tokio::spawn({
            let queue = queue.clone();
            async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user("next"), EnqueueOptions::default())
                    .await
            }
        });
        settle().await;
        assert_eq!(probe.active.load(Ordering::SeqCst), 2);
        next.await.unwrap().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported_and_counted() {
        let (queue, _) = probe_queue(QueueConfig::default(), Duration::from_millis(1));
        let err = queue
            .enqueue(backend(), RequestEnvelope::user("fail"), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Failed(_)));
        assert!(!err.is_admission());
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let (queue, _) = probe_queue(
            QueueConfig::default()
                .with_max_concurrency(1)
                .with_max_queue_size(1),
            Duration::from_secs(1),
        );
        let mut handles = Vec::new();
        for name in ["running", "waiting"] {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user(name), EnqueueOptions::default())
                    .await
            }));
            settle().await;
        }

        let err = queue
            .enqueue(backend(), RequestEnvelope::user("overflow"), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 1 }));
        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_waiting() {
        let (queue, _) = probe_queue(
            QueueConfig::default().with_max_concurrency(1),
            Duration::from_secs(1),
        );
        let mut handles = Vec::new();
        for name in ["running", "w1", "w2"] {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user(name), EnqueueOptions::default())
                    .await
            }));
            settle().await;
        }

        assert_eq!(queue.clear(), 2);
        let results: Vec<_> = futures::future::join_all(handles).await;
        let cancelled = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| matches!(r, Err(QueueError::Cancelled)))
            .count();
        assert_eq!(cancelled, 2);
        assert_eq!(queue.stats().cancelled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_releases_entry() {
        let (queue, _) = probe_queue(
            QueueConfig::default().with_max_concurrency(1),
            Duration::from_secs(5),
        );
        let running = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user("running"), EnqueueOptions::default())
                    .await
            })
        };
        settle().await;
        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(backend(), RequestEnvelope::user("waiting"), EnqueueOptions::default())
                    .await
            })
        };
        settle().await;
        assert_eq!(queue.pending(), 1);

        waiting.abort();
        let _ = waiting.await;
        assert_eq!(queue.pending(), 0);
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_backend_override_and_stats() {
        let (queue, probe) = probe_queue(QueueConfig::default(), Duration::from_millis(50));
        queue.set_max_concurrency(&backend(), 1);

        let futures: Vec<_> = (0..3)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .enqueue(backend(), RequestEnvelope::user(format!("r{i}")), EnqueueOptions::default())
                        .await
                })
            })
            .collect();
        for f in futures::future::join_all(futures).await {
            f.unwrap().unwrap();
        }

        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        let per = &stats.per_backend[&backend()];
        assert_eq!(per.completed, 3);
        assert_eq!(per.max_concurrency, 1);
        assert!(stats.average_wait > Duration::ZERO);
    }
}
