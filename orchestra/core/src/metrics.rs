//! Orchestrator Metrics
//!
//! Observability for the orchestration pipeline:
//! - Request outcomes per backend
//! - Latency distributions
//! - Retries, fallbacks, and rejections by subsystem
//! - Accumulated cost
//!
//! Counters are lock-free atomics; per-backend entries live in a `DashMap`.
//! [`OrchestratorMetrics::snapshot`] produces a plain value that can be
//! rendered in Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::backend::BackendId;
use crate::resilience::CircuitState;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket boundaries (inclusive)
    buckets: Vec<f64>,
    /// Count per bucket; the last slot counts values above every boundary
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets in milliseconds
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120_000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len());

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramSnapshot {
    /// Upper bucket boundaries
    pub buckets: Vec<f64>,
    /// Count per bucket plus one overflow slot
    pub counts: Vec<u64>,
    /// Values recorded
    pub total: u64,
    /// Sum of values (truncated to integers)
    pub sum: u64,
    /// Smallest value
    pub min: u64,
    /// Largest value
    pub max: u64,
    /// Mean value
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket containing the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets.get(i).copied().unwrap_or(self.max as f64);
            }
        }

        self.max as f64
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 90th percentile
    #[must_use]
    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Zeroed counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Backend Metrics
// ============================================================================

/// Which subsystem turned a request away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Circuit was open
    Circuit,
    /// Rate limiter queue full or wait too long
    RateLimit,
    /// Request queue full, timed out, or cleared
    Queue,
}

/// Metrics for a single backend
#[derive(Debug)]
pub struct BackendMetrics {
    /// Calls started
    pub requests: Counter,
    /// Calls that returned a response
    pub successes: Counter,
    /// Calls that ended in a backend error
    pub failures: Counter,
    /// Retries performed
    pub retries: Counter,
    /// Rejected by an open circuit
    pub circuit_rejections: Counter,
    /// Rejected by the rate limiter
    pub rate_limit_rejections: Counter,
    /// Cost in micro-dollars
    cost_micros: Counter,
    /// Latency of completed calls, ms
    pub latency: Histogram,
}

impl BackendMetrics {
    fn new() -> Self {
        Self {
            requests: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            retries: Counter::new(),
            circuit_rejections: Counter::new(),
            rate_limit_rejections: Counter::new(),
            cost_micros: Counter::new(),
            latency: Histogram::latency_default(),
        }
    }

    /// Accumulated cost in USD
    #[must_use]
    pub fn cost(&self) -> f64 {
        self.cost_micros.get() as f64 / 1_000_000.0
    }

    fn summary(&self, backend: &BackendId, circuit: Option<CircuitState>) -> BackendSummary {
        let latency = self.latency.snapshot();
        let requests = self.requests.get();
        let failures = self.failures.get();
        BackendSummary {
            backend: backend.clone(),
            requests,
            successes: self.successes.get(),
            failures,
            retries: self.retries.get(),
            circuit_rejections: self.circuit_rejections.get(),
            rate_limit_rejections: self.rate_limit_rejections.get(),
            error_rate: if requests == 0 { 0.0 } else { failures as f64 / requests as f64 },
            cost: self.cost(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
            circuit,
        }
    }
}

/// Per-backend figures in a [`MetricsSnapshot`]
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSummary {
    /// Backend
    pub backend: BackendId,
    /// Calls started
    pub requests: u64,
    /// Calls that succeeded
    pub successes: u64,
    /// Calls that failed
    pub failures: u64,
    /// Retries performed
    pub retries: u64,
    /// Open-circuit rejections
    pub circuit_rejections: u64,
    /// Rate-limit rejections
    pub rate_limit_rejections: u64,
    /// `failures / requests`
    pub error_rate: f64,
    /// Accumulated cost, USD
    pub cost: f64,
    /// Median latency, ms
    pub latency_p50_ms: f64,
    /// 99th percentile latency, ms
    pub latency_p99_ms: f64,
    /// Mean latency, ms
    pub latency_mean_ms: f64,
    /// Circuit state, when known
    pub circuit: Option<CircuitState>,
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

/// Centralized metrics for the orchestrator
#[derive(Debug)]
pub struct OrchestratorMetrics {
    backends: DashMap<BackendId, Arc<BackendMetrics>>,

    /// Requests routed
    pub routed: Counter,
    /// Routing failures
    pub routing_failures: Counter,
    /// Chats that used a fallback backend
    pub fallbacks: Counter,
    /// Chats where every backend failed
    pub exhausted: Counter,
    /// Queue rejections
    pub queue_rejections: Counter,
    /// End-to-end latency, ms
    pub latency: Histogram,

    started_at: Instant,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    /// Fresh collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
            routed: Counter::new(),
            routing_failures: Counter::new(),
            fallbacks: Counter::new(),
            exhausted: Counter::new(),
            queue_rejections: Counter::new(),
            latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Get or create metrics for a backend
    pub fn backend(&self, backend: &BackendId) -> Arc<BackendMetrics> {
        if let Some(metrics) = self.backends.get(backend) {
            return Arc::clone(&metrics);
        }
        Arc::clone(
            self.backends
                .entry(backend.clone())
                .or_insert_with(|| Arc::new(BackendMetrics::new()))
                .value(),
        )
    }

    /// Count a call that reached the executor, whatever its outcome
    pub fn record_request(&self, backend: &BackendId) {
        self.backend(backend).requests.inc();
    }

    /// Count a successful call
    pub fn record_success(&self, backend: &BackendId, latency: Duration, cost: f64, retries: u32) {
        let metrics = self.backend(backend);
        metrics.successes.inc();
        metrics.retries.add(u64::from(retries));
        metrics.latency.record_duration(latency);
        metrics.cost_micros.add((cost.max(0.0) * 1_000_000.0).round() as u64);
        self.latency.record_duration(latency);
    }

    /// Count a failed call
    pub fn record_failure(&self, backend: &BackendId, latency: Duration, retries: u32) {
        let metrics = self.backend(backend);
        metrics.failures.inc();
        metrics.retries.add(u64::from(retries));
        metrics.latency.record_duration(latency);
    }

    /// Count a rejection
    pub fn record_rejection(&self, backend: &BackendId, rejection: Rejection) {
        match rejection {
            Rejection::Circuit => self.backend(backend).circuit_rejections.inc(),
            Rejection::RateLimit => self.backend(backend).rate_limit_rejections.inc(),
            Rejection::Queue => self.queue_rejections.inc(),
        }
    }

    /// Time since the collector was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Point-in-time copy; `circuit` supplies the state for each backend
    pub fn snapshot(&self, circuit: impl Fn(&BackendId) -> Option<CircuitState>) -> MetricsSnapshot {
        let mut backends: Vec<BackendSummary> = self
            .backends
            .iter()
            .map(|e| e.value().summary(e.key(), circuit(e.key())))
            .collect();
        backends.sort_by(|a, b| a.backend.cmp(&b.backend));

        let latency = self.latency.snapshot();
        MetricsSnapshot {
            uptime: self.uptime(),
            requests: backends.iter().map(|b| b.requests).sum(),
            successes: backends.iter().map(|b| b.successes).sum(),
            failures: backends.iter().map(|b| b.failures).sum(),
            retries: backends.iter().map(|b| b.retries).sum(),
            total_cost: backends.iter().map(|b| b.cost).sum(),
            routed: self.routed.get(),
            routing_failures: self.routing_failures.get(),
            fallbacks: self.fallbacks.get(),
            exhausted: self.exhausted.get(),
            queue_rejections: self.queue_rejections.get(),
            queue_pending: 0,
            queue_processing: 0,
            latency_p50_ms: latency.p50(),
            latency_p90_ms: latency.p90(),
            latency_p99_ms: latency.p99(),
            backends,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Orchestrator metrics at one point in time
#[derive(Clone, Debug, PartialEq)]
pub struct MetricsSnapshot {
    /// Collector age
    pub uptime: Duration,
    /// Calls started
    pub requests: u64,
    /// Calls that succeeded
    pub successes: u64,
    /// Calls that failed
    pub failures: u64,
    /// Retries across all backends
    pub retries: u64,
    /// Cost across all backends, USD
    pub total_cost: f64,
    /// Requests routed
    pub routed: u64,
    /// Routing failures
    pub routing_failures: u64,
    /// Chats answered by a fallback backend
    pub fallbacks: u64,
    /// Chats where every backend failed
    pub exhausted: u64,
    /// Queue rejections
    pub queue_rejections: u64,
    /// Waiting queue entries
    pub queue_pending: usize,
    /// Running queue entries
    pub queue_processing: usize,
    /// Median end-to-end latency, ms
    pub latency_p50_ms: f64,
    /// 90th percentile latency, ms
    pub latency_p90_ms: f64,
    /// 99th percentile latency, ms
    pub latency_p99_ms: f64,
    /// Per-backend breakdown, sorted by backend
    pub backends: Vec<BackendSummary>,
}

fn circuit_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

impl MetricsSnapshot {
    /// Render in Prometheus text exposition format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("orchestra_routed_total", "Requests routed", self.routed),
            ("orchestra_routing_failures_total", "Routing failures", self.routing_failures),
            ("orchestra_fallbacks_total", "Chats answered by a fallback backend", self.fallbacks),
            ("orchestra_exhausted_total", "Chats where every backend failed", self.exhausted),
            ("orchestra_queue_rejections_total", "Requests rejected by the queue", self.queue_rejections),
        ];
        for (name, help, value) in counters {
            let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n");
        }

        let _ = write!(
            out,
            "# HELP orchestra_queue_depth Queue entries by stage\n\
             # TYPE orchestra_queue_depth gauge\n\
             orchestra_queue_depth{{stage=\"pending\"}} {}\n\
             orchestra_queue_depth{{stage=\"processing\"}} {}\n\n",
            self.queue_pending, self.queue_processing
        );

        let _ = write!(
            out,
            "# HELP orchestra_latency_ms End-to-end latency percentiles\n\
             # TYPE orchestra_latency_ms gauge\n\
             orchestra_latency_ms{{quantile=\"0.5\"}} {}\n\
             orchestra_latency_ms{{quantile=\"0.9\"}} {}\n\
             orchestra_latency_ms{{quantile=\"0.99\"}} {}\n\n",
            self.latency_p50_ms, self.latency_p90_ms, self.latency_p99_ms
        );

        if self.backends.is_empty() {
            return out;
        }

        let per_backend: [(&str, &str, &str, fn(&BackendSummary) -> String); 7] = [
            ("orchestra_backend_requests_total", "Calls per backend", "counter", |b| b.requests.to_string()),
            ("orchestra_backend_failures_total", "Failed calls per backend", "counter", |b| b.failures.to_string()),
            ("orchestra_backend_retries_total", "Retries per backend", "counter", |b| b.retries.to_string()),
            ("orchestra_backend_circuit_rejections_total", "Open-circuit rejections", "counter", |b| {
                b.circuit_rejections.to_string()
            }),
            ("orchestra_backend_rate_limit_rejections_total", "Rate-limit rejections", "counter", |b| {
                b.rate_limit_rejections.to_string()
            }),
            ("orchestra_backend_cost_usd_total", "Accumulated cost in USD", "counter", |b| format!("{:.6}", b.cost)),
            ("orchestra_backend_latency_p50_ms", "Median latency per backend", "gauge", |b| b.latency_p50_ms.to_string()),
        ];
        for (name, help, kind, value) in per_backend {
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} {kind}");
            for b in &self.backends {
                let _ = writeln!(out, "{name}{{backend=\"{}\"}} {}", b.backend, value(b));
            }
            out.push('\n');
        }

        let _ = writeln!(
            out,
            "# HELP orchestra_circuit_state Circuit state (0 closed, 1 half-open, 2 open)\n\
             # TYPE orchestra_circuit_state gauge"
        );
        for b in &self.backends {
            if let Some(state) = b.circuit {
                let _ = writeln!(
                    out,
                    "orchestra_circuit_state{{backend=\"{}\"}} {}",
                    b.backend,
                    circuit_value(state)
                );
            }
        }

        out
    }
}

// ============================================================================
// Tests
// ============================================================================
