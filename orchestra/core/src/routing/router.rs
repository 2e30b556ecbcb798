//! Model Router
//!
//! Chooses a backend for each request.
//!
//! # Decision Order
//!
//! ```text
//! route(request, constraints)
//!     |
//!     v
//! 0. find the first enabled rule matching the request
//!     |
//!     v
//! 1. decision cache hit?  ──yes──> cached decision (from_cache = true)
//!    (keyed on request shape, constraints and the matched rule)
//!     |
//!     v
//! 2. apply the matched rule
//!        Backend(id)          -> that backend
//!        Strategy{s, extra}   -> strategy s under constraints + extra
//!     |
//!     v
//! 3. adaptive: best learned backend for this fingerprint
//!    (>= adaptive_min_samples, still within constraints)
//!     |
//!     v
//! 4. strategy from the request's goal, else the configured default
//! ```
//!
//! Candidates always come from the registry filtered by the constraints.
//! The selection is never repeated in `alternatives`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendId, RequestEnvelope};
use crate::registry::{CallOutcome, ModelDefinition, ModelRegistry, RoutingConstraints};

use super::adaptive::{AdaptiveLearner, Fingerprint};
use super::balancer::LoadBalancer;
use super::decision::{DecisionCache, DecisionSource, RoutingDecision};
use super::rules::{RoutingRule, RuleSet, RuleTarget};
use super::strategy::{self, RoutingStrategy, Scored};
use super::{RouterConfig, RoutingError};

// ============================================================================
// Stats
// ============================================================================

/// Router counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouterStats {
    /// `route` calls that returned a decision
    pub decisions: u64,
    /// Served from cache
    pub cache_hits: u64,
    /// Decided by a rule
    pub rule_matches: u64,
    /// Decided by adaptive learning
    pub adaptive_selections: u64,
    /// Decisions per strategy, cache hits included
    pub by_strategy: HashMap<RoutingStrategy, u64>,
    /// Routing rules installed
    pub rules: usize,
    /// `(fingerprint, backend)` pairs learned
    pub learned_pairs: usize,
    /// Cached decisions
    pub cached_decisions: usize,
}

#[derive(Default)]
struct Counters {
    decisions: AtomicU64,
    cache_hits: AtomicU64,
    rule_matches: AtomicU64,
    adaptive_selections: AtomicU64,
    by_strategy: Mutex<HashMap<RoutingStrategy, u64>>,
}

// ============================================================================
// Model Router
// ============================================================================

/// Picks a backend per request
pub struct ModelRouter {
    config: RouterConfig,
    registry: Arc<ModelRegistry>,
    rules: RwLock<RuleSet>,
    learner: AdaptiveLearner,
    cache: DecisionCache,
    balancer: LoadBalancer,
    counters: Counters,
}

impl ModelRouter {
    /// Create a router over `registry`
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, config: RouterConfig) -> Self {
        let mut rules = RuleSet::default();
        for rule in &config.rules {
            if !rules.add(rule.clone()) {
                tracing::warn!(rule = %rule.name, "Ignoring duplicate routing rule");
            }
        }
        Self {
            cache: DecisionCache::new(config.decision_cache_ttl),
            balancer: LoadBalancer::new(config.sticky_session_ttl),
            learner: AdaptiveLearner::new(),
            rules: RwLock::new(rules),
            counters: Counters::default(),
            registry,
            config,
        }
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Registry the router reads from
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Choose a backend for `request`
    ///
    /// # Errors
    ///
    /// [`RoutingError::NoCandidates`] when nothing satisfies the constraints,
    /// [`RoutingError::UnknownBackend`] when a matching rule names an
    /// unregistered backend.
    pub fn route(
        &self,
        request: &RequestEnvelope,
        constraints: &RoutingConstraints,
    ) -> Result<RoutingDecision, RoutingError> {
        let rule = self.rules.read().first_match(request).cloned();
        let cache_key = self.config.cache_decisions.then(|| {
            DecisionCache::key(request, constraints, rule.as_ref().map(|r| r.name.as_str()))
        });

        if let Some(key) = &cache_key {
            if let Some(decision) = self.cache.get(key) {
                tracing::trace!(backend = %decision.backend, "Routing decision served from cache");
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.count(decision.strategy);
                return Ok(decision);
            }
        }

        let decision = self.decide(request, constraints, rule.as_ref())?;
        tracing::debug!(
            backend = %decision.backend,
            strategy = %decision.strategy,
            source = ?decision.source,
            alternatives = decision.alternatives.len(),
            "Routing decision"
        );

        // Rotating strategies must not be pinned by the cache
        if let Some(key) = cache_key {
            if !decision.strategy.is_load_balanced() {
                self.cache.insert(key, decision.clone());
            }
        }
        self.count(decision.strategy);
        Ok(decision)
    }

    fn count(&self, strategy: RoutingStrategy) {
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        *self.counters.by_strategy.lock().entry(strategy).or_insert(0) += 1;
    }

    fn decide(
        &self,
        request: &RequestEnvelope,
        constraints: &RoutingConstraints,
        rule: Option<&RoutingRule>,
    ) -> Result<RoutingDecision, RoutingError> {
        if let Some(rule) = rule {
            if let Some(decision) = self.apply_rule(rule, request, constraints)? {
                self.counters.rule_matches.fetch_add(1, Ordering::Relaxed);
                return Ok(decision);
            }
        }

        let candidates = self.registry.find(constraints, request);
        if candidates.is_empty() {
            return Err(RoutingError::NoCandidates {
                reason: "no registered backend satisfies the constraints".into(),
            });
        }

        if self.config.adaptive_learning {
            if let Some(decision) = self.adaptive(request, &candidates) {
                self.counters
                    .adaptive_selections
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(decision);
            }
        }

        let strategy = request
            .optimize
            .map_or(self.config.default_strategy, RoutingStrategy::from_goal);
        self.by_strategy(strategy, request, &candidates, DecisionSource::Strategy, None)
    }

    /// `Ok(None)` when the rule cannot be applied and routing should continue
    fn apply_rule(
        &self,
        rule: &RoutingRule,
        request: &RequestEnvelope,
        constraints: &RoutingConstraints,
    ) -> Result<Option<RoutingDecision>, RoutingError> {
        match &rule.target {
            RuleTarget::Backend(backend) => {
                let model = self
                    .registry
                    .get(backend)
                    .ok_or_else(|| RoutingError::UnknownBackend(backend.clone()))?;
                if !model.available {
                    tracing::warn!(rule = %rule.name, backend = %backend, "Rule target unavailable; skipping rule");
                    return Ok(None);
                }
                let others: Vec<_> = self
                    .registry
                    .find(constraints, request)
                    .into_iter()
                    .filter(|m| m.id != *backend)
                    .collect();
                let alternatives = strategy::rank_balanced(&others, &self.config.weights)
                    .into_iter()
                    .map(|s| s.model.id)
                    .collect();
                Ok(Some(RoutingDecision {
                    backend: backend.clone(),
                    strategy: self.config.default_strategy,
                    source: DecisionSource::Rule,
                    rule: Some(rule.name.clone()),
                    estimated_cost: model.estimate_cost(request),
                    estimated_latency: model.estimated_latency(),
                    confidence: 1.0,
                    alternatives,
                    rationale: format!("rule '{}' routes to {backend}", rule.name),
                    from_cache: false,
                }))
            }
            RuleTarget::Strategy {
                strategy,
                constraints: extra,
            } => {
                let merged = extra
                    .as_ref()
                    .map_or_else(|| constraints.clone(), |extra| constraints.merged(extra));
                let candidates = self.registry.find(&merged, request);
                if candidates.is_empty() {
                    tracing::warn!(rule = %rule.name, "Rule constraints exclude every backend; skipping rule");
                    return Ok(None);
                }
                self.by_strategy(*strategy, request, &candidates, DecisionSource::Rule, Some(&rule.name))
                    .map(Some)
            }
        }
    }

    fn adaptive(&self, request: &RequestEnvelope, candidates: &[ModelDefinition]) -> Option<RoutingDecision> {
        let fingerprint = Fingerprint::of(request);
        let ids: Vec<_> = candidates.iter().map(|m| m.id.clone()).collect();
        let (backend, metric) = self
            .learner
            .best(&fingerprint, &ids, self.config.adaptive_min_samples)?;
        let model = candidates.iter().find(|m| m.id == backend)?;

        let others: Vec<_> = candidates.iter().filter(|m| m.id != backend).cloned().collect();
        let alternatives = strategy::rank_balanced(&others, &self.config.weights)
            .into_iter()
            .map(|s| s.model.id)
            .collect();
        let sample_weight = (metric.samples as f64 / (2 * self.config.adaptive_min_samples.max(1)) as f64).min(1.0);

        Some(RoutingDecision {
            estimated_cost: model.estimate_cost(request),
            estimated_latency: model.estimated_latency(),
            confidence: (metric.success_rate * sample_weight).clamp(0.0, 1.0),
            alternatives,
            rationale: format!(
                "adaptive: {} samples for fingerprint {fingerprint}, success rate {:.0}%",
                metric.samples,
                metric.success_rate * 100.0
            ),
            backend,
            strategy: self.config.default_strategy,
            source: DecisionSource::Adaptive,
            rule: None,
            from_cache: false,
        })
    }

    fn by_strategy(
        &self,
        strategy: RoutingStrategy,
        request: &RequestEnvelope,
        candidates: &[ModelDefinition],
        source: DecisionSource,
        rule: Option<&str>,
    ) -> Result<RoutingDecision, RoutingError> {
        let (strategy, ranked, note) = self.rank(strategy, request, candidates);
        let mut ranked = ranked.into_iter();
        let Some(head) = ranked.next() else {
            return Err(RoutingError::NoCandidates {
                reason: format!("{strategy} produced no ranking"),
            });
        };

        let count = candidates.len();
        let rationale = match (rule, note) {
            (Some(name), _) => format!("rule '{name}' applied {strategy} over {count} candidate(s)"),
            (None, Some(note)) => format!("{note}; {strategy} over {count} candidate(s)"),
            (None, None) => format!("{strategy} over {count} candidate(s)"),
        };

        let model = head.model;
        Ok(RoutingDecision {
            estimated_cost: model.estimate_cost(request),
            estimated_latency: model.estimated_latency(),
            confidence: if count == 1 { 1.0 } else { head.score.clamp(0.0, 1.0) },
            alternatives: ranked.map(|s| s.model.id).filter(|id| *id != model.id).collect(),
            rationale,
            backend: model.id,
            strategy,
            source,
            rule: rule.map(str::to_string),
            from_cache: false,
        })
    }

    /// Ranking for `strategy`, best first
    fn rank(
        &self,
        strategy: RoutingStrategy,
        request: &RequestEnvelope,
        candidates: &[ModelDefinition],
    ) -> (RoutingStrategy, Vec<Scored>, Option<String>) {
        match strategy {
            RoutingStrategy::CostOptimized => (strategy, strategy::rank_by_cost(candidates), None),
            RoutingStrategy::QualityOptimized => (strategy, strategy::rank_by_quality(candidates), None),
            RoutingStrategy::LatencyOptimized => (strategy, strategy::rank_by_latency(candidates), None),
            RoutingStrategy::Balanced => (
                strategy,
                strategy::rank_balanced(candidates, &self.config.weights),
                None,
            ),
            RoutingStrategy::CapabilityMatch => match strategy::rank_by_capability(candidates, request) {
                Some(ranked) => (strategy, ranked, None),
                None => (
                    RoutingStrategy::Balanced,
                    strategy::rank_balanced(candidates, &self.config.weights),
                    Some("no capability match".to_string()),
                ),
            },
            lb => {
                let mut ranked = strategy::rank_balanced(candidates, &self.config.weights);
                if let Some(pick) = self.balancer.select(lb, candidates, request.user_id.as_deref()) {
                    if let Some(pos) = ranked.iter().position(|s| s.model.id == pick) {
                        let mut head = ranked.remove(pos);
                        head.score = 1.0 / candidates.len() as f64;
                        ranked.insert(0, head);
                    }
                }
                (lb, ranked, None)
            }
        }
    }

    // ========================================================================
    // Learning
    // ========================================================================

    /// Fold a completed request into adaptive learning
    pub fn record_outcome(&self, request: &RequestEnvelope, backend: &BackendId, outcome: &CallOutcome) {
        if self.config.adaptive_learning {
            self.learner.record(&Fingerprint::of(request), backend, outcome);
        }
    }

    /// Learned data as JSON
    #[must_use]
    pub fn export_learning_data(&self) -> serde_json::Value {
        self.learner.export()
    }

    /// Merge learned data; returns the number of pairs imported
    ///
    /// # Errors
    ///
    /// [`RoutingError::LearningData`] for malformed input.
    pub fn import_learning_data(&self, data: serde_json::Value) -> Result<usize, RoutingError> {
        let n = self.learner.import(data)?;
        self.cache.clear();
        Ok(n)
    }

    /// Forget all learned data
    pub fn reset_learning(&self) {
        self.learner.reset();
        self.cache.clear();
        tracing::info!("Adaptive learning data reset");
    }

    /// Learner, for inspection
    #[must_use]
    pub fn learner(&self) -> &AdaptiveLearner {
        &self.learner
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Install a rule
    ///
    /// # Errors
    ///
    /// [`RoutingError::DuplicateRule`] if the name is taken.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        let name = rule.name.clone();
        if !self.rules.write().add(rule) {
            return Err(RoutingError::DuplicateRule(name));
        }
        self.cache.clear();
        tracing::info!(rule = %name, "Routing rule added");
        Ok(())
    }

    /// Remove a rule by name
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownRule`] if no rule has that name.
    pub fn remove_rule(&self, name: &str) -> Result<RoutingRule, RoutingError> {
        let removed = self
            .rules
            .write()
            .remove(name)
            .ok_or_else(|| RoutingError::UnknownRule(name.to_string()))?;
        self.cache.clear();
        tracing::info!(rule = %name, "Routing rule removed");
        Ok(removed)
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().rules().to_vec()
    }

    /// Drop every cached decision
    pub fn clear_decision_cache(&self) {
        self.cache.clear();
    }

    /// Count an opened connection for least-connections balancing
    pub fn acquire_connection(&self, backend: &BackendId) {
        self.balancer.acquire_connection(backend);
    }

    /// Count a closed connection
    pub fn release_connection(&self, backend: &BackendId) {
        self.balancer.release_connection(backend);
    }

    /// Snapshot of router counters
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            decisions: self.counters.decisions.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            rule_matches: self.counters.rule_matches.load(Ordering::Relaxed),
            adaptive_selections: self.counters.adaptive_selections.load(Ordering::Relaxed),
            by_strategy: self.counters.by_strategy.lock().clone(),
            rules: self.rules.read().rules().len(),
            learned_pairs: self.learner.len(),
            cached_decisions: self.cache.len(),
        }
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OptimizationGoal;
    use crate::registry::QualityTier;
    use crate::routing::RuleCondition;
    use std::time::Duration;

    fn id(name: &str) -> BackendId {
        BackendId::new("p", name)
    }

    fn router_with(models: Vec<ModelDefinition>, config: RouterConfig) -> ModelRouter {
        let registry = Arc::new(ModelRegistry::new());
        for m in models {
            registry.register(m);
        }
        ModelRouter::new(registry, config)
    }

    fn priced() -> Vec<ModelDefinition> {
        vec![
            ModelDefinition::new(id("a"))
                .with_pricing(0.02, 0.02)
                .with_quality_tier(QualityTier::Premium),
            ModelDefinition::new(id("b"))
                .with_pricing(0.005, 0.005)
                .with_quality_tier(QualityTier::Standard),
        ]
    }

    #[test]
    fn test_cost_goal_with_budget_selects_cheap_backend() {
        let router = router_with(priced(), RouterConfig::default());
        let request = RequestEnvelope::user("hello").with_optimize(OptimizationGoal::Cost);
        let decision = router
            .route(&request, &RoutingConstraints::new().with_max_cost(0.01))
            .unwrap();
        assert_eq!(decision.backend, id("b"));
        assert_eq!(decision.strategy, RoutingStrategy::CostOptimized);
        assert!(decision.alternatives.is_empty());
    }

    #[test]
    fn test_alternatives_exclude_selection() {
        let router = router_with(priced(), RouterConfig::default());
        let decision = router
            .route(
                &RequestEnvelope::user("hi").with_optimize(OptimizationGoal::Quality),
                &RoutingConstraints::new(),
            )
            .unwrap();
        assert_eq!(decision.backend, id("a"));
        assert_eq!(decision.alternatives, vec![id("b")]);
    }

    #[test]
    fn test_no_candidates() {
        let router = router_with(priced(), RouterConfig::default());
        let err = router
            .route(&RequestEnvelope::user("hi"), &RoutingConstraints::new().with_max_cost(0.0))
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoCandidates { .. }));
    }

    #[test]
    fn test_cache_returns_identical_decision() {
        let router = router_with(priced(), RouterConfig::default());
        let request = RequestEnvelope::user("hi");
        let first = router.route(&request, &RoutingConstraints::new()).unwrap();
        let second = router.route(&request, &RoutingConstraints::new()).unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(RoutingDecision { from_cache: false, ..second }, first);
        assert_eq!(router.stats().cache_hits, 1);

        router.clear_decision_cache();
        assert!(!router.route(&request, &RoutingConstraints::new()).unwrap().from_cache);
    }

    #[test]
    fn test_round_robin_alternates_even_with_cache() {
        let config = RouterConfig {
            default_strategy: RoutingStrategy::RoundRobin,
            ..RouterConfig::default()
        };
        let router = router_with(
            vec![ModelDefinition::new(id("x")), ModelDefinition::new(id("y"))],
            config,
        );
        let request = RequestEnvelope::user("hi");
        let picks: Vec<_> = (0..4)
            .map(|_| {
                router
                    .route(&request, &RoutingConstraints::new())
                    .unwrap()
                    .backend
                    .model()
                    .to_string()
            })
            .collect();
        assert_eq!(picks, vec!["x", "y", "x", "y"]);
    }

    #[test]
    fn test_rule_to_backend_wins() {
        let router = router_with(priced(), RouterConfig::default());
        router
            .add_rule(RoutingRule::to_backend("code-to-b", RuleCondition::task_type("code"), id("b")))
            .unwrap();

        let decision = router
            .route(&RequestEnvelope::user("x").with_task_type("code"), &RoutingConstraints::new())
            .unwrap();
        assert_eq!(decision.backend, id("b"));
        assert_eq!(decision.rule.as_deref(), Some("code-to-b"));
        assert_eq!(decision.source, DecisionSource::Rule);
        assert_eq!(decision.alternatives, vec![id("a")]);

        assert!(matches!(
            router.add_rule(RoutingRule::to_backend("code-to-b", RuleCondition::any(), id("a"))),
            Err(RoutingError::DuplicateRule(_))
        ));
        router.remove_rule("code-to-b").unwrap();
        assert!(matches!(router.remove_rule("code-to-b"), Err(RoutingError::UnknownRule(_))));
    }

    #[test]
    fn test_cached_decision_does_not_bypass_rule() {
        use crate::backend::Priority;

        let router = router_with(priced(), RouterConfig::default());
        router
            .add_rule(RoutingRule::to_backend(
                "high-to-b",
                RuleCondition {
                    priority: Some(Priority::High),
                    ..RuleCondition::default()
                },
                id("b"),
            ))
            .unwrap();
        let constraints = RoutingConstraints::new();
        let normal = RequestEnvelope::user("x").with_optimize(OptimizationGoal::Quality);
        let high = normal.clone().with_priority(Priority::High);

        let first = router.route(&normal, &constraints).unwrap();
        assert_eq!(first.backend, id("a"));
        assert!(router.route(&normal, &constraints).unwrap().from_cache);

        let ruled = router.route(&high, &constraints).unwrap();
        assert_eq!(ruled.backend, id("b"));
        assert_eq!(ruled.rule.as_deref(), Some("high-to-b"));
        assert!(!ruled.from_cache);

        // Each entry serves only requests matched by the same rule
        assert_eq!(router.route(&high, &constraints).unwrap().backend, id("b"));
        assert_eq!(router.route(&normal, &constraints).unwrap().backend, id("a"));
    }

    #[test]
    fn test_cached_decision_respects_user_and_size_rules() {
        let router = router_with(priced(), RouterConfig::default());
        router
            .add_rule(RoutingRule::to_backend(
                "vip",
                RuleCondition {
                    user_ids: vec!["vip".into()],
                    ..RuleCondition::default()
                },
                id("b"),
            ))
            .unwrap();
        router
            .add_rule(RoutingRule::to_backend(
                "long",
                RuleCondition {
                    min_total_chars: Some(50),
                    ..RuleCondition::default()
                },
                id("b"),
            ))
            .unwrap();
        let constraints = RoutingConstraints::new();
        let goal = OptimizationGoal::Quality;

        assert_eq!(
            router.route(&RequestEnvelope::user("hi").with_optimize(goal), &constraints).unwrap().backend,
            id("a")
        );
        assert_eq!(
            router
                .route(&RequestEnvelope::user("hi").with_optimize(goal).with_user_id("vip"), &constraints)
                .unwrap()
                .backend,
            id("b")
        );
        assert_eq!(
            router
                .route(&RequestEnvelope::user("y".repeat(60)).with_optimize(goal), &constraints)
                .unwrap()
                .backend,
            id("b")
        );
    }

    #[test]
    fn test_rule_to_unknown_backend_errors() {
        let router = router_with(priced(), RouterConfig::default());
        router
            .add_rule(RoutingRule::to_backend("ghost", RuleCondition::any(), id("ghost")))
            .unwrap();
        assert!(matches!(
            router.route(&RequestEnvelope::user("x"), &RoutingConstraints::new()),
            Err(RoutingError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_rule_with_strategy_and_constraints() {
        let router = router_with(priced(), RouterConfig::default());
        router
            .add_rule(RoutingRule::to_strategy(
                "premium-only",
                RuleCondition::any(),
                RoutingStrategy::CostOptimized,
                Some(RoutingConstraints::new().with_min_quality(QualityTier::Premium)),
            ))
            .unwrap();
        let decision = router
            .route(&RequestEnvelope::user("x"), &RoutingConstraints::new())
            .unwrap();
        assert_eq!(decision.backend, id("a"));
        assert_eq!(decision.strategy, RoutingStrategy::CostOptimized);
    }

    #[test]
    fn test_adaptive_pick_after_min_samples() {
        let config = RouterConfig {
            adaptive_min_samples: 3,
            cache_decisions: false,
            default_strategy: RoutingStrategy::CostOptimized,
            ..RouterConfig::default()
        };
        let router = router_with(priced(), config);
        let request = RequestEnvelope::user("hi");
        assert_eq!(router.route(&request, &RoutingConstraints::new()).unwrap().backend, id("b"));

        for _ in 0..3 {
            router.record_outcome(
                &request,
                &id("a"),
                &CallOutcome::success(Duration::from_millis(50), 0.01).with_quality(Some(0.9)),
            );
        }
        let decision = router.route(&request, &RoutingConstraints::new()).unwrap();
        assert_eq!(decision.backend, id("a"));
        assert_eq!(decision.source, DecisionSource::Adaptive);
        assert_eq!(decision.alternatives, vec![id("b")]);
        assert_eq!(router.stats().adaptive_selections, 1);

        // Adaptive picks still honour constraints
        let capped = RoutingConstraints::new().with_max_cost(0.01);
        assert_eq!(router.route(&request, &capped).unwrap().backend, id("b"));

        let exported = router.export_learning_data();
        router.reset_learning();
        assert_eq!(router.route(&request, &RoutingConstraints::new()).unwrap().backend, id("b"));
        assert_eq!(router.import_learning_data(exported).unwrap(), 1);
        assert_eq!(router.route(&request, &RoutingConstraints::new()).unwrap().backend, id("a"));
    }

    #[test]
    fn test_capability_falls_back_to_balanced() {
        let config = RouterConfig {
            default_strategy: RoutingStrategy::CapabilityMatch,
            ..RouterConfig::default()
        };
        let models = vec![
            ModelDefinition::new(id("general")),
            ModelDefinition::new(id("coder")).with_specialization("code"),
        ];
        let router = router_with(models, config);

        let code = router
            .route(&RequestEnvelope::user("x").with_task_type("code"), &RoutingConstraints::new())
            .unwrap();
        assert_eq!(code.backend, id("coder"));
        assert_eq!(code.strategy, RoutingStrategy::CapabilityMatch);

        let plain = router
            .route(&RequestEnvelope::user("x"), &RoutingConstraints::new())
            .unwrap();
        assert_eq!(plain.strategy, RoutingStrategy::Balanced);
        assert!(plain.rationale.contains("no capability match"));
    }

    #[test]
    fn test_least_connections_through_router() {
        let config = RouterConfig {
            default_strategy: RoutingStrategy::LeastConnections,
            ..RouterConfig::default()
        };
        let router = router_with(
            vec![ModelDefinition::new(id("x")), ModelDefinition::new(id("y"))],
            config,
        );
        router.acquire_connection(&id("x"));
        let decision = router.route(&RequestEnvelope::user("hi"), &RoutingConstraints::new()).unwrap();
        assert_eq!(decision.backend, id("y"));
        assert_eq!(decision.alternatives, vec![id("x")]);
        router.release_connection(&id("x"));
    }
}
