//! Load balancer
//!
//! Picks among already-filtered candidates when the routing strategy is one
//! of the load-balancing ones. Keeps its own rotation counter, connection
//! counts, and sticky-session pins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::backend::BackendId;
use crate::registry::ModelDefinition;

use super::strategy::RoutingStrategy;

/// New pins between sweeps of expired pins
const STICKY_SWEEP_INTERVAL: usize = 256;

struct StickyPin {
    backend: BackendId,
    expires_at: Instant,
}

/// Load-balancing state shared across routing calls
pub struct LoadBalancer {
    rotation: AtomicUsize,
    connections: DashMap<BackendId, usize>,
    sticky: DashMap<String, StickyPin>,
    sticky_ttl: Duration,
    pins_created: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer; sticky pins last `sticky_ttl` after last use
    #[must_use]
    pub fn new(sticky_ttl: Duration) -> Self {
        Self {
            rotation: AtomicUsize::new(0),
            connections: DashMap::new(),
            sticky: DashMap::new(),
            sticky_ttl,
            pins_created: AtomicUsize::new(0),
        }
    }

    /// Pick one candidate with `strategy`
    ///
    /// Candidates must be sorted by id so rotation is stable. Returns `None`
    /// only for an empty slice or a non-balancing strategy.
    pub fn select(
        &self,
        strategy: RoutingStrategy,
        candidates: &[ModelDefinition],
        user_id: Option<&str>,
    ) -> Option<BackendId> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            RoutingStrategy::RoundRobin => Some(self.round_robin(candidates)),
            RoutingStrategy::Weighted => Some(Self::weighted(candidates)),
            RoutingStrategy::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|m| m.id.clone()),
            RoutingStrategy::LeastConnections => Some(self.least_connections(candidates)),
            RoutingStrategy::StickySession => Some(self.sticky(candidates, user_id)),
            _ => None,
        }
    }

    fn round_robin(&self, candidates: &[ModelDefinition]) -> BackendId {
        let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
        candidates[turn % candidates.len()].id.clone()
    }

    fn weighted(candidates: &[ModelDefinition]) -> BackendId {
        match WeightedIndex::new(candidates.iter().map(|m| m.weight)) {
            Ok(dist) => candidates[dist.sample(&mut rand::thread_rng())].id.clone(),
            // All weights zero
            Err(_) => candidates[0].id.clone(),
        }
    }

    fn least_connections(&self, candidates: &[ModelDefinition]) -> BackendId {
        candidates
            .iter()
            .min_by_key(|m| self.connections(&m.id))
            .map_or_else(|| candidates[0].id.clone(), |m| m.id.clone())
    }

    fn sticky(&self, candidates: &[ModelDefinition], user_id: Option<&str>) -> BackendId {
        let Some(user) = user_id else {
            return self.round_robin(candidates);
        };
        let now = Instant::now();

        if let Some(mut pin) = self.sticky.get_mut(user) {
            let still_valid = pin.expires_at > now && candidates.iter().any(|m| m.id == pin.backend);
            if still_valid {
                pin.expires_at = now + self.sticky_ttl;
                return pin.backend.clone();
            }
        }

        let backend = self.round_robin(candidates);
        tracing::debug!(user, backend = %backend, "Pinned sticky session");
        self.sticky.insert(
            user.to_string(),
            StickyPin {
                backend: backend.clone(),
                expires_at: now + self.sticky_ttl,
            },
        );
        if (self.pins_created.fetch_add(1, Ordering::Relaxed) + 1) % STICKY_SWEEP_INTERVAL == 0 {
            let removed = self.prune_sticky_at(now);
            tracing::trace!(removed, "Swept expired sticky pins");
        }
        backend
    }

    /// Count an opened connection
    pub fn acquire_connection(&self, backend: &BackendId) {
        *self.connections.entry(backend.clone()).or_insert(0) += 1;
    }

    /// Count a closed connection
    pub fn release_connection(&self, backend: &BackendId) {
        if let Some(mut count) = self.connections.get_mut(backend) {
            *count = count.saturating_sub(1);
        }
    }

    /// Open connections for `backend`
    #[must_use]
    pub fn connections(&self, backend: &BackendId) -> usize {
        self.connections.get(backend).map_or(0, |c| *c)
    }

    /// Drop expired sticky pins; returns how many were removed
    ///
    /// Also runs on its own every [`STICKY_SWEEP_INTERVAL`] new pins.
    pub fn prune_sticky(&self) -> usize {
        self.prune_sticky_at(Instant::now())
    }

    fn prune_sticky_at(&self, now: Instant) -> usize {
        let before = self.sticky.len();
        self.sticky.retain(|_, pin| pin.expires_at > now);
        before.saturating_sub(self.sticky.len())
    }

    /// Active sticky pins
    #[must_use]
    pub fn sticky_sessions(&self) -> usize {
        self.sticky.len()
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("sticky_ttl", &self.sticky_ttl)
            .field("sticky_sessions", &self.sticky.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&str]) -> Vec<ModelDefinition> {
        names
            .iter()
            .map(|n| ModelDefinition::new(BackendId::new("p", *n)))
            .collect()
    }

    fn pick(lb: &LoadBalancer, strategy: RoutingStrategy, c: &[ModelDefinition], user: Option<&str>) -> String {
        lb.select(strategy, c, user).unwrap().model().to_string()
    }

    #[test]
    fn test_round_robin_alternates() {
        let lb = LoadBalancer::new(Duration::from_secs(60));
        let c = candidates(&["x", "y"]);
        let picks: Vec<_> = (0..4).map(|_| pick(&lb, RoutingStrategy::RoundRobin, &c, None)).collect();
        assert_eq!(picks, vec!["x", "y", "x", "y"]);
    }

    #[test]
    fn test_weighted_respects_zero_weight() {
        let lb = LoadBalancer::new(Duration::from_secs(60));
        let c = vec![
            ModelDefinition::new(BackendId::new("p", "never")).with_weight(0),
            ModelDefinition::new(BackendId::new("p", "always")).with_weight(5),
        ];
        for _ in 0..50 {
            assert_eq!(pick(&lb, RoutingStrategy::Weighted, &c, None), "always");
        }
    }

    #[test]
    fn test_random_stays_in_candidates() {
        let lb = LoadBalancer::new(Duration::from_secs(60));
        let c = candidates(&["a", "b", "c"]);
        for _ in 0..20 {
            let p = pick(&lb, RoutingStrategy::Random, &c, None);
            assert!(["a", "b", "c"].contains(&p.as_str()));
        }
        assert!(lb.select(RoutingStrategy::Random, &[], None).is_none());
        assert!(lb.select(RoutingStrategy::Balanced, &c, None).is_none());
    }

    #[test]
    fn test_least_connections() {
        let lb = LoadBalancer::new(Duration::from_secs(60));
        let c = candidates(&["a", "b"]);
        lb.acquire_connection(&BackendId::new("p", "a"));
        assert_eq!(pick(&lb, RoutingStrategy::LeastConnections, &c, None), "b");

        lb.acquire_connection(&BackendId::new("p", "b"));
        lb.acquire_connection(&BackendId::new("p", "b"));
        assert_eq!(pick(&lb, RoutingStrategy::LeastConnections, &c, None), "a");

        lb.release_connection(&BackendId::new("p", "b"));
        lb.release_connection(&BackendId::new("p", "b"));
        assert_eq!(lb.connections(&BackendId::new("p", "b")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_session_pins_until_ttl() {
        let lb = LoadBalancer::new(Duration::from_secs(10));
        let c = candidates(&["a", "b"]);

        let first = pick(&lb, RoutingStrategy::StickySession, &c, Some("alice"));
        for _ in 0..3 {
            assert_eq!(pick(&lb, RoutingStrategy::StickySession, &c, Some("alice")), first);
        }
        assert_eq!(lb.sticky_sessions(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(lb.prune_sticky(), 1);
        assert_eq!(lb.sticky_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pins_swept_as_sessions_arrive() {
        let lb = LoadBalancer::new(Duration::from_secs(10));
        let c = candidates(&["a", "b"]);
        for user in 0..100 {
            pick(&lb, RoutingStrategy::StickySession, &c, Some(&format!("old-{user}")));
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        for user in 0..STICKY_SWEEP_INTERVAL - 100 {
            pick(&lb, RoutingStrategy::StickySession, &c, Some(&format!("new-{user}")));
        }
        assert_eq!(lb.sticky_sessions(), STICKY_SWEEP_INTERVAL - 100);
    }

    #[test]
    fn test_sticky_repins_when_backend_disappears() {
        let lb = LoadBalancer::new(Duration::from_secs(60));
        let both = candidates(&["a", "b"]);
        let first = pick(&lb, RoutingStrategy::StickySession, &both, Some("bob"));
        let remaining: Vec<_> = both.into_iter().filter(|m| m.id.model() != first).collect();
        let second = pick(&lb, RoutingStrategy::StickySession, &remaining, Some("bob"));
        assert_ne!(first, second);
    }
}
