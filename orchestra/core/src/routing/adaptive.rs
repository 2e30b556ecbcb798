//! Adaptive learning
//!
//! Remembers how each backend performed for each request shape and lets the
//! router prefer the backend that has done best for similar requests.
//!
//! A request's shape is its [`Fingerprint`]: message count bucket, tools and
//! images flags, average message length bucket, and optimisation goal. It
//! never looks at message content, so the key space stays small.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, OptimizationGoal, RequestEnvelope};
use crate::registry::CallOutcome;

use super::RoutingError;

/// Current learning-data export format
pub const LEARNING_DATA_VERSION: u32 = 1;

// ============================================================================
// Fingerprint
// ============================================================================

/// Content-free summary of a request's shape
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// `floor(log2(message_count))`, capped at 4
    pub message_bucket: u8,
    /// Tools requested
    pub tools: bool,
    /// Images attached
    pub images: bool,
    /// 0 short (<100 chars), 1 medium (<500), 2 long (<2000), 3 very long
    pub length_bucket: u8,
    /// Requested optimisation goal
    pub goal: Option<OptimizationGoal>,
}

impl Fingerprint {
    /// Fingerprint a request
    #[must_use]
    pub fn of(request: &RequestEnvelope) -> Self {
        let count = request.messages.len().max(1);
        let message_bucket = u8::try_from(count.ilog2().min(4)).unwrap_or(4);
        let length_bucket = match request.average_message_len() {
            0..=99 => 0,
            100..=499 => 1,
            500..=1999 => 2,
            _ => 3,
        };
        Self {
            message_bucket,
            tools: request.uses_tools,
            images: request.has_images(),
            length_bucket,
            goal: request.optimize,
        }
    }

    /// Compact hex key (crc32 of the fields)
    #[must_use]
    pub fn key(&self) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[
            self.message_bucket,
            u8::from(self.tools),
            u8::from(self.images),
            self.length_bucket,
            match self.goal {
                None => 0,
                Some(OptimizationGoal::Cost) => 1,
                Some(OptimizationGoal::Quality) => 2,
                Some(OptimizationGoal::Latency) => 3,
                Some(OptimizationGoal::Balanced) => 4,
            },
        ]);
        hex::encode(hasher.finalize().to_be_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Running averages for one `(fingerprint, backend)` pair
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveMetric {
    /// Outcomes folded in
    pub samples: u64,
    /// Fraction of successful outcomes
    pub success_rate: f64,
    /// Mean reported quality
    pub avg_quality: Option<f64>,
    /// Mean cost of successful calls
    pub avg_cost: f64,
    /// Mean latency, milliseconds
    pub avg_latency_ms: f64,
    #[serde(default)]
    quality_samples: u64,
    #[serde(default)]
    successes: u64,
}

impl AdaptiveMetric {
    fn record(&mut self, outcome: &CallOutcome) {
        self.samples += 1;
        let n = self.samples as f64;
        if outcome.success {
            self.successes += 1;
            let s = self.successes as f64;
            self.avg_cost += (outcome.cost - self.avg_cost) / s;
        }
        self.success_rate = self.successes as f64 / n;
        let latency_ms = outcome.latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
        if let Some(q) = outcome.quality {
            self.quality_samples += 1;
            let prev = self.avg_quality.unwrap_or(0.0);
            self.avg_quality = Some(prev + (q - prev) / self.quality_samples as f64);
        }
    }

    /// Preference score: success dominates, quality refines
    #[must_use]
    pub fn score(&self) -> f64 {
        0.6 * self.success_rate + 0.4 * self.avg_quality.unwrap_or(0.5)
    }
}

#[derive(Serialize, Deserialize)]
struct LearningEntry {
    fingerprint: String,
    backend: BackendId,
    metric: AdaptiveMetric,
}

#[derive(Serialize, Deserialize)]
struct LearningData {
    version: u32,
    entries: Vec<LearningEntry>,
}

// ============================================================================
// Learner
// ============================================================================

/// Outcome store keyed by `(fingerprint key, backend)`
#[derive(Default)]
pub struct AdaptiveLearner {
    metrics: DashMap<(String, BackendId), AdaptiveMetric>,
}

impl AdaptiveLearner {
    /// Empty learner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one outcome in
    pub fn record(&self, fingerprint: &Fingerprint, backend: &BackendId, outcome: &CallOutcome) {
        self.metrics
            .entry((fingerprint.key(), backend.clone()))
            .or_default()
            .record(outcome);
    }

    /// Metric for one pair
    #[must_use]
    pub fn metric(&self, fingerprint: &Fingerprint, backend: &BackendId) -> Option<AdaptiveMetric> {
        self.metrics
            .get(&(fingerprint.key(), backend.clone()))
            .map(|m| m.clone())
    }

    /// Best-scoring backend among `candidates` with at least `min_samples`
    #[must_use]
    pub fn best(
        &self,
        fingerprint: &Fingerprint,
        candidates: &[BackendId],
        min_samples: u64,
    ) -> Option<(BackendId, AdaptiveMetric)> {
        let key = fingerprint.key();
        candidates
            .iter()
            .filter_map(|backend| {
                let metric = self.metrics.get(&(key.clone(), backend.clone()))?;
                (metric.samples >= min_samples).then(|| (backend.clone(), metric.clone()))
            })
            .max_by(|(a_id, a), (b_id, b)| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        b.avg_latency_ms
                            .partial_cmp(&a.avg_latency_ms)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| b_id.cmp(a_id))
            })
    }

    /// Number of `(fingerprint, backend)` pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// True when nothing has been learned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Forget everything
    pub fn reset(&self) {
        self.metrics.clear();
    }

    /// Snapshot as JSON
    #[must_use]
    pub fn export(&self) -> serde_json::Value {
        let mut entries: Vec<LearningEntry> = self
            .metrics
            .iter()
            .map(|e| LearningEntry {
                fingerprint: e.key().0.clone(),
                backend: e.key().1.clone(),
                metric: e.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.fingerprint
                .cmp(&b.fingerprint)
                .then_with(|| a.backend.cmp(&b.backend))
        });
        let data = LearningData {
            version: LEARNING_DATA_VERSION,
            entries,
        };
        serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
    }

    /// Merge a snapshot from [`AdaptiveLearner::export`]; imported pairs
    /// replace existing ones. Returns the number of pairs imported.
    ///
    /// # Errors
    ///
    /// [`RoutingError::LearningData`] for malformed input or an unknown version.
    pub fn import(&self, value: serde_json::Value) -> Result<usize, RoutingError> {
        let data: LearningData = serde_json::from_value(value)?;
        if data.version != LEARNING_DATA_VERSION {
            return Err(RoutingError::LearningData(format!(
                "unsupported version {}",
                data.version
            )));
        }
        let count = data.entries.len();
        for entry in data.entries {
            self.metrics
                .insert((entry.fingerprint, entry.backend), entry.metric);
        }
        tracing::info!(pairs = count, "Imported adaptive learning data");
        Ok(count)
    }
}

impl fmt::Debug for AdaptiveLearner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveLearner")
            .field("pairs", &self.metrics.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ok(ms: u64) -> CallOutcome {
        CallOutcome::success(Duration::from_millis(ms), 0.01)
    }

    #[test]
    fn test_fingerprint_ignores_content() {
        let a = Fingerprint::of(&RequestEnvelope::user("hello there"));
        let b = Fingerprint::of(&RequestEnvelope::user("something else"));
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 8);
    }

    #[test]
    fn test_fingerprint_buckets() {
        let short = Fingerprint::of(&RequestEnvelope::user("hi"));
        assert_eq!(short.message_bucket, 0);
        assert_eq!(short.length_bucket, 0);

        let many = RequestEnvelope::new(vec![ChatMessage::user("x".repeat(600)); 5]);
        let fp = Fingerprint::of(&many);
        assert_eq!(fp.message_bucket, 2);
        assert_eq!(fp.length_bucket, 2);

        let tools = Fingerprint::of(&RequestEnvelope::user("hi").with_tools());
        assert_ne!(tools.key(), short.key());

        let goal = Fingerprint::of(&RequestEnvelope::user("hi").with_optimize(OptimizationGoal::Cost));
        assert_ne!(goal.key(), short.key());
    }

    #[test]
    fn test_best_requires_min_samples() {
        let learner = AdaptiveLearner::new();
        let fp = Fingerprint::of(&RequestEnvelope::user("hi"));
        let a = BackendId::new("p", "a");
        let b = BackendId::new("p", "b");

        for _ in 0..3 {
            learner.record(&fp, &a, &ok(100));
        }
        assert!(learner.best(&fp, &[a.clone(), b.clone()], 5).is_none());

        for _ in 0..2 {
            learner.record(&fp, &a, &ok(100));
        }
        let (best, metric) = learner.best(&fp, &[a.clone(), b], 5).unwrap();
        assert_eq!(best, a);
        assert_eq!(metric.samples, 5);
        assert!((metric.success_rate - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_best_prefers_reliable_backend() {
        let learner = AdaptiveLearner::new();
        let fp = Fingerprint::of(&RequestEnvelope::user("hi"));
        let flaky = BackendId::new("p", "flaky");
        let solid = BackendId::new("p", "solid");

        for i in 0..10 {
            learner.record(&fp, &solid, &ok(200));
            if i % 2 == 0 {
                learner.record(&fp, &flaky, &ok(50));
            } else {
                learner.record(&fp, &flaky, &CallOutcome::failure(Duration::from_millis(50)));
            }
        }
        let (best, _) = learner.best(&fp, &[flaky, solid.clone()], 10).unwrap();
        assert_eq!(best, solid);
    }

    #[test]
    fn test_export_import_reset() {
        let learner = AdaptiveLearner::new();
        let fp = Fingerprint::of(&RequestEnvelope::user("hi"));
        let a = BackendId::new("p", "a");
        learner.record(&fp, &a, &ok(100).with_quality(Some(0.8)));

        let exported = learner.export();
        assert_eq!(exported["version"], LEARNING_DATA_VERSION);

        let other = AdaptiveLearner::new();
        assert_eq!(other.import(exported).unwrap(), 1);
        assert_eq!(other.metric(&fp, &a), learner.metric(&fp, &a));

        learner.reset();
        assert!(learner.is_empty());
    }

    #[test]
    fn test_import_rejects_bad_data() {
        let learner = AdaptiveLearner::new();
        assert!(learner.import(serde_json::json!({"nope": true})).is_err());
        assert!(learner
            .import(serde_json::json!({"version": 99, "entries": []}))
            .is_err());
    }
}
