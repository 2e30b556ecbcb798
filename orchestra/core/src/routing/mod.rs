//! Model Routing
//!
//! Chooses which backend serves a request.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   ModelRouter    |  <-- route(request, constraints)
//! +--------+---------+
//!          |
//!   +------+-------+-----------+-------------+
//!   |              |           |             |
//!   v              v           v             v
//! DecisionCache  RuleSet  AdaptiveLearner  strategies / LoadBalancer
//!                                               |
//!                                               v
//!                                     ModelRegistry (candidates)
//! ```

pub mod adaptive;
pub mod balancer;
pub mod decision;
pub mod router;
pub mod rules;
pub mod strategy;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendId;

pub use adaptive::{AdaptiveLearner, AdaptiveMetric, Fingerprint};
pub use balancer::LoadBalancer;
pub use decision::{DecisionCache, DecisionSource, RoutingDecision};
pub use router::{ModelRouter, RouterStats};
pub use rules::{RoutingRule, RuleCondition, RuleSet, RuleTarget};
pub use strategy::{RoutingStrategy, ScoringWeights};

// ============================================================================
// Configuration
// ============================================================================

/// Router configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Strategy when the request sets no goal
    pub default_strategy: RoutingStrategy,

    /// Weights for the balanced strategy
    pub weights: ScoringWeights,

    /// Learn from outcomes
    pub adaptive_learning: bool,

    /// Samples needed before a learned preference is used
    pub adaptive_min_samples: u64,

    /// Cache decisions by request shape
    pub cache_decisions: bool,

    /// Decision cache entry lifetime
    #[serde(with = "secs")]
    pub decision_cache_ttl: Duration,

    /// Sticky session pin lifetime
    #[serde(with = "secs")]
    pub sticky_session_ttl: Duration,

    /// Rules installed at construction
    pub rules: Vec<RoutingRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::Balanced,
            weights: ScoringWeights::default(),
            adaptive_learning: true,
            adaptive_min_samples: 10,
            cache_decisions: true,
            decision_cache_ttl: Duration::from_secs(300),
            sticky_session_ttl: Duration::from_secs(1800),
            rules: Vec::new(),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Routing failures
#[derive(Clone, Debug, Error)]
pub enum RoutingError {
    /// No backend survived filtering
    #[error("no candidate backend: {reason}")]
    NoCandidates {
        /// Why the set was empty
        reason: String,
    },

    /// A rule names a backend the registry does not know
    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),

    /// No rule with that name
    #[error("unknown routing rule: {0}")]
    UnknownRule(String),

    /// A rule with that name exists
    #[error("routing rule already exists: {0}")]
    DuplicateRule(String),

    /// Learning data could not be imported
    #[error("invalid learning data: {0}")]
    LearningData(String),
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        Self::LearningData(err.to_string())
    }
}
