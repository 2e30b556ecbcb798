//! Selection strategies
//!
//! Every scoring strategy turns the constraint-matched candidate set into a
//! ranking, best first. The router takes the head as its selection and the
//! tail as alternatives.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::backend::{OptimizationGoal, RequestEnvelope};
use crate::registry::ModelDefinition;

/// How the router picks a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Lowest combined per-1K price
    CostOptimized,
    /// Highest quality tier
    QualityOptimized,
    /// Lowest observed latency
    LatencyOptimized,
    /// Weighted blend of cost, quality, latency, and reliability
    #[default]
    Balanced,
    /// First backend specialised in the request's task type
    CapabilityMatch,
    /// Rotate through candidates
    RoundRobin,
    /// Random pick weighted by model weight
    Weighted,
    /// Uniform random pick
    Random,
    /// Fewest open connections
    LeastConnections,
    /// Pin each user to one backend for a while
    StickySession,
}

impl RoutingStrategy {
    /// Strategy implied by a request's optimisation goal
    #[must_use]
    pub fn from_goal(goal: OptimizationGoal) -> Self {
        match goal {
            OptimizationGoal::Cost => Self::CostOptimized,
            OptimizationGoal::Quality => Self::QualityOptimized,
            OptimizationGoal::Latency => Self::LatencyOptimized,
            OptimizationGoal::Balanced => Self::Balanced,
        }
    }

    /// Whether selection is delegated to the load balancer
    #[must_use]
    pub fn is_load_balanced(self) -> bool {
        matches!(
            self,
            Self::RoundRobin
                | Self::Weighted
                | Self::Random
                | Self::LeastConnections
                | Self::StickySession
        )
    }

    /// Kebab-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CostOptimized => "cost-optimized",
            Self::QualityOptimized => "quality-optimized",
            Self::LatencyOptimized => "latency-optimized",
            Self::Balanced => "balanced",
            Self::CapabilityMatch => "capability-match",
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::Random => "random",
            Self::LeastConnections => "least-connections",
            Self::StickySession => "sticky-session",
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    /// Accepts kebab-case or snake_case names, case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        ALL_STRATEGIES
            .into_iter()
            .find(|strategy| strategy.as_str() == wanted)
            .ok_or_else(|| format!("unknown routing strategy: {s}"))
    }
}

const ALL_STRATEGIES: [RoutingStrategy; 10] = [
    RoutingStrategy::CostOptimized,
    RoutingStrategy::QualityOptimized,
    RoutingStrategy::LatencyOptimized,
    RoutingStrategy::Balanced,
    RoutingStrategy::CapabilityMatch,
    RoutingStrategy::RoundRobin,
    RoutingStrategy::Weighted,
    RoutingStrategy::Random,
    RoutingStrategy::LeastConnections,
    RoutingStrategy::StickySession,
];

// ============================================================================
// Weights
// ============================================================================

/// Factor weights for [`RoutingStrategy::Balanced`]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Cheaper is better
    pub cost: f64,
    /// Higher quality is better
    pub quality: f64,
    /// Faster is better
    pub latency: f64,
    /// Higher success rate is better
    pub reliability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cost: 0.25,
            quality: 0.35,
            latency: 0.25,
            reliability: 0.15,
        }
    }
}

impl ScoringWeights {
    /// Weights scaled to sum to 1; defaults if all are zero or negative
    #[must_use]
    pub fn normalized(&self) -> Self {
        let clamp = |w: f64| if w.is_finite() { w.max(0.0) } else { 0.0 };
        let (c, q, l, r) = (
            clamp(self.cost),
            clamp(self.quality),
            clamp(self.latency),
            clamp(self.reliability),
        );
        let sum = c + q + l + r;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            cost: c / sum,
            quality: q / sum,
            latency: l / sum,
            reliability: r / sum,
        }
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// A candidate with its strategy score in `[0, 1]`
#[derive(Clone, Debug)]
pub struct Scored {
    /// Candidate
    pub model: ModelDefinition,
    /// Higher is better
    pub score: f64,
}

/// Maps `value` in `[min, max]` onto `[0, 1]`, inverted when lower is better
fn normalize(value: f64, min: f64, max: f64, lower_is_better: bool) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        return 1.0;
    }
    let n = (value - min) / (max - min);
    if lower_is_better {
        1.0 - n
    } else {
        n
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

fn latency_ms(model: &ModelDefinition) -> f64 {
    model.estimated_latency().as_secs_f64() * 1000.0
}

fn by_score_then_id(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.model.id.cmp(&b.model.id))
}

/// Cheapest first
#[must_use]
pub fn rank_by_cost(candidates: &[ModelDefinition]) -> Vec<Scored> {
    let (lo, hi) = bounds(candidates.iter().map(|m| m.pricing.combined_per_1k()));
    let mut ranked: Vec<_> = candidates
        .iter()
        .map(|m| Scored {
            score: normalize(m.pricing.combined_per_1k(), lo, hi, true),
            model: m.clone(),
        })
        .collect();
    ranked.sort_by(|a, b| {
        a.model
            .pricing
            .combined_per_1k()
            .partial_cmp(&b.model.pricing.combined_per_1k())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.model.id.cmp(&b.model.id))
    });
    ranked
}

/// Highest tier first, ties broken by recorded average quality
#[must_use]
pub fn rank_by_quality(candidates: &[ModelDefinition]) -> Vec<Scored> {
    let mut ranked: Vec<_> = candidates
        .iter()
        .map(|m| Scored {
            score: m.quality_tier.score(),
            model: m.clone(),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.model
            .quality_tier
            .cmp(&a.model.quality_tier)
            .then_with(|| {
                let qa = a.model.metrics.avg_quality.unwrap_or(0.0);
                let qb = b.model.metrics.avg_quality.unwrap_or(0.0);
                qb.partial_cmp(&qa).unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.model.id.cmp(&b.model.id))
    });
    ranked
}

/// Fastest first
#[must_use]
pub fn rank_by_latency(candidates: &[ModelDefinition]) -> Vec<Scored> {
    let (lo, hi) = bounds(candidates.iter().map(latency_ms));
    let mut ranked: Vec<_> = candidates
        .iter()
        .map(|m| Scored {
            score: normalize(latency_ms(m), lo, hi, true),
            model: m.clone(),
        })
        .collect();
    ranked.sort_by(by_score_then_id);
    ranked
}

/// Weighted blend of normalised cost, quality, latency, and reliability
#[must_use]
pub fn rank_balanced(candidates: &[ModelDefinition], weights: &ScoringWeights) -> Vec<Scored> {
    let w = weights.normalized();
    let (cost_lo, cost_hi) = bounds(candidates.iter().map(|m| m.pricing.combined_per_1k()));
    let (lat_lo, lat_hi) = bounds(candidates.iter().map(latency_ms));

    let mut ranked: Vec<_> = candidates
        .iter()
        .map(|m| {
            let cost = normalize(m.pricing.combined_per_1k(), cost_lo, cost_hi, true);
            let latency = normalize(latency_ms(m), lat_lo, lat_hi, true);
            let quality = m.quality_score().clamp(0.0, 1.0);
            let reliability = m.metrics.success_rate();
            Scored {
                score: w.cost * cost + w.quality * quality + w.latency * latency + w.reliability * reliability,
                model: m.clone(),
            }
        })
        .collect();
    ranked.sort_by(by_score_then_id);
    ranked
}

/// Specialists in the request's task type first, in id order
///
/// Returns `None` when the request has no task type or nobody specialises
/// in it.
#[must_use]
pub fn rank_by_capability(candidates: &[ModelDefinition], request: &RequestEnvelope) -> Option<Vec<Scored>> {
    let task = request.task_type.as_deref()?;
    let (mut specialists, others): (Vec<_>, Vec<_>) = candidates
        .iter()
        .cloned()
        .partition(|m| m.capabilities.specializes_in(task));
    if specialists.is_empty() {
        return None;
    }
    specialists.sort_by(|a, b| a.id.cmp(&b.id));
    let mut ranked: Vec<_> = specialists
        .into_iter()
        .map(|model| Scored { model, score: 1.0 })
        .collect();
    ranked.extend(others.into_iter().map(|model| Scored { model, score: 0.0 }));
    Some(ranked)
}

// ============================================================================
// Tests
// ============================================================================
