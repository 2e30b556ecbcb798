//! Routing decisions and the decision cache

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{BackendId, RequestEnvelope};
use crate::registry::RoutingConstraints;

use super::adaptive::Fingerprint;
use super::strategy::RoutingStrategy;

/// Where a decision came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// A routing rule
    Rule,
    /// Adaptive learning
    Adaptive,
    /// The resolved strategy
    Strategy,
}

/// The router's answer for one request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected backend
    pub backend: BackendId,

    /// Strategy that produced the ranking
    pub strategy: RoutingStrategy,

    /// Stage that made the choice
    pub source: DecisionSource,

    /// Name of the matched rule
    pub rule: Option<String>,

    /// Estimated cost in USD
    pub estimated_cost: f64,

    /// Estimated latency
    pub estimated_latency: Duration,

    /// Confidence in `[0, 1]`
    pub confidence: f64,

    /// Other acceptable backends, best first; never contains `backend`
    pub alternatives: Vec<BackendId>,

    /// Human-readable explanation
    pub rationale: String,

    /// Served from the decision cache
    pub from_cache: bool,
}

impl RoutingDecision {
    /// Selected backend followed by the alternatives
    #[must_use]
    pub fn chain(&self) -> Vec<BackendId> {
        std::iter::once(self.backend.clone())
            .chain(self.alternatives.iter().filter(|b| **b != self.backend).cloned())
            .collect()
    }
}

// ============================================================================
// Decision Cache
// ============================================================================

/// Inserts between sweeps of expired entries
const SWEEP_INTERVAL: u64 = 256;

struct CachedDecision {
    decision: RoutingDecision,
    expires_at: Instant,
}

/// TTL cache of decisions keyed by request shape and constraints
pub struct DecisionCache {
    ttl: Duration,
    entries: DashMap<String, CachedDecision>,
    inserts: AtomicU64,
}

impl DecisionCache {
    /// Create a cache whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            inserts: AtomicU64::new(0),
        }
    }

    /// Cache key for a request under constraints
    ///
    /// Combines the request fingerprint with the remaining routing inputs
    /// (task type, features, output budget, constraints) and the name of the
    /// rule matching the request, if any. Rule conditions look at fields the
    /// fingerprint buckets away, so requests matched by different rules never
    /// share an entry. Content is never part of the key.
    #[must_use]
    pub fn key(
        request: &RequestEnvelope,
        constraints: &RoutingConstraints,
        matched_rule: Option<&str>,
    ) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(request.task_type.as_deref().unwrap_or_default().as_bytes());
        hasher.update(&[0]);
        match matched_rule {
            Some(name) => {
                hasher.update(&[1]);
                hasher.update(name.as_bytes());
            }
            None => hasher.update(&[0]),
        }
        hasher.update(&[0]);
        let features = request.effective_features();
        hasher.update(&[
            u8::from(features.vision),
            u8::from(features.function_calling),
            u8::from(features.json_mode),
            u8::from(features.streaming),
        ]);
        hasher.update(&request.expected_output_tokens().to_be_bytes());
        hasher.update(serde_json::to_string(constraints).unwrap_or_default().as_bytes());
        format!(
            "{}-{}",
            Fingerprint::of(request).key(),
            hex::encode(hasher.finalize().to_be_bytes())
        )
    }

    /// Fresh cached decision, marked `from_cache`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<RoutingDecision> {
        let now = Instant::now();
        let hit = self.entries.get(key).and_then(|entry| {
            (entry.expires_at > now).then(|| {
                let mut decision = entry.decision.clone();
                decision.from_cache = true;
                decision
            })
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    /// Store a decision
    ///
    /// Every [`SWEEP_INTERVAL`] inserts, expired entries are evicted.
    pub fn insert(&self, key: String, decision: RoutingDecision) {
        let now = Instant::now();
        self.entries.insert(
            key,
            CachedDecision {
                decision,
                expires_at: now + self.ttl,
            },
        );
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.purge_expired_at(now);
        }
    }

    /// Evict expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries currently stored, including expired ones not yet evicted
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(model: &str) -> RoutingDecision {
        RoutingDecision {
            backend: BackendId::new("p", model),
            strategy: RoutingStrategy::Balanced,
            source: DecisionSource::Strategy,
            rule: None,
            estimated_cost: 0.0,
            estimated_latency: Duration::ZERO,
            confidence: 1.0,
            alternatives: vec![BackendId::new("p", "alt")],
            rationale: String::new(),
            from_cache: false,
        }
    }

    #[test]
    fn test_chain_puts_selection_first() {
        let d = decision("main");
        assert_eq!(d.chain(), vec![BackendId::new("p", "main"), BackendId::new("p", "alt")]);
    }

    #[test]
    fn test_key_depends_on_shape_not_content() {
        let none = RoutingConstraints::new();
        let a = DecisionCache::key(&RequestEnvelope::user("hello"), &none, None);
        let b = DecisionCache::key(&RequestEnvelope::user("world"), &none, None);
        assert_eq!(a, b);

        let capped = RoutingConstraints::new().with_max_cost(0.01);
        assert_ne!(a, DecisionCache::key(&RequestEnvelope::user("hello"), &capped, None));
        assert_ne!(
            a,
            DecisionCache::key(&RequestEnvelope::user("hello").with_task_type("code"), &none, None)
        );
    }

    #[test]
    fn test_key_separates_matched_rules() {
        let none = RoutingConstraints::new();
        let request = RequestEnvelope::user("hello");
        let plain = DecisionCache::key(&request, &none, None);
        let ruled = DecisionCache::key(&request, &none, Some("high-to-b"));
        assert_ne!(plain, ruled);
        assert_ne!(ruled, DecisionCache::key(&request, &none, Some("other")));
        assert_eq!(ruled, DecisionCache::key(&request, &none, Some("high-to-b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_on_insert() {
        let cache = DecisionCache::new(Duration::from_secs(1));
        for i in 0..10 {
            cache.insert(format!("old-{i}"), decision("a"));
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        // Distinct keys are never looked up again, so only the sweep evicts them
        for i in 0..SWEEP_INTERVAL - 10 {
            cache.insert(format!("new-{i}"), decision("a"));
        }
        assert_eq!(cache.len(), usize::try_from(SWEEP_INTERVAL).unwrap() - 10);
        assert!(cache.get("old-0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = DecisionCache::new(Duration::from_secs(1));
        cache.insert("a".into(), decision("a"));
        cache.insert("b".into(), decision("b"));
        assert_eq!(cache.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        cache.insert("k".into(), decision("a"));

        let hit = cache.get("k").unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.backend, BackendId::new("p", "a"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = DecisionCache::new(Duration::from_secs(1));
        cache.insert("k".into(), decision("a"));
        cache.clear();
        assert!(cache.get("k").is_none());
    }
}
