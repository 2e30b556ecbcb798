//! Routing constraints
//!
//! Hard limits a candidate backend must satisfy. Shared by the registry's
//! lookups and every router strategy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{FeatureSet, RequestEnvelope};

use super::model::{ModelDefinition, QualityTier};

/// Limits applied when choosing a backend
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConstraints {
    /// Maximum estimated cost of the request, USD
    pub max_cost_per_request: Option<f64>,

    /// Maximum estimated latency
    pub max_latency: Option<Duration>,

    /// Minimum quality tier
    pub min_quality: Option<QualityTier>,

    /// Only these providers (empty = any)
    pub allowed_providers: Vec<String>,

    /// Never these providers
    pub denied_providers: Vec<String>,

    /// Only these models, by model name or `provider/model` (empty = any)
    pub allowed_models: Vec<String>,

    /// Never these models
    pub denied_models: Vec<String>,

    /// Required specialization
    pub task_type: Option<String>,

    /// Minimum context window, tokens
    pub min_context_window: Option<u32>,

    /// Features the backend must support
    pub required_features: FeatureSet,
}

/// Why a candidate was rejected
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintViolation {
    /// Marked unavailable
    Unavailable,
    /// Estimated cost too high
    Cost {
        /// Estimate
        estimated: f64,
        /// Limit
        max: f64,
    },
    /// Estimated latency too high
    Latency {
        /// Estimate
        estimated: Duration,
        /// Limit
        max: Duration,
    },
    /// Tier too low
    Quality {
        /// Model's tier
        tier: QualityTier,
        /// Required tier
        min: QualityTier,
    },
    /// Provider filtered out
    Provider,
    /// Model filtered out
    Model,
    /// Missing specialization
    TaskType(String),
    /// Context window too small
    ContextWindow {
        /// Model's window
        window: u32,
        /// Tokens needed
        needed: u32,
    },
    /// A required feature is missing
    Features,
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("unavailable"),
            Self::Cost { estimated, max } => write!(f, "cost {estimated:.4} exceeds {max:.4}"),
            Self::Latency { estimated, max } => {
                write!(f, "latency {estimated:?} exceeds {max:?}")
            }
            Self::Quality { tier, min } => write!(f, "quality {tier} below {min}"),
            Self::Provider => f.write_str("provider not allowed"),
            Self::Model => f.write_str("model not allowed"),
            Self::TaskType(task) => write!(f, "no {task} specialization"),
            Self::ContextWindow { window, needed } => {
                write!(f, "context window {window} below {needed}")
            }
            Self::Features => f.write_str("missing required features"),
        }
    }
}

fn listed(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v.eq_ignore_ascii_case(value))
}

impl RoutingConstraints {
    /// No constraints
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the estimated cost
    #[must_use]
    pub fn with_max_cost(mut self, max: f64) -> Self {
        self.max_cost_per_request = Some(max);
        self
    }

    /// Cap the estimated latency
    #[must_use]
    pub fn with_max_latency(mut self, max: Duration) -> Self {
        self.max_latency = Some(max);
        self
    }

    /// Require a minimum tier
    #[must_use]
    pub fn with_min_quality(mut self, tier: QualityTier) -> Self {
        self.min_quality = Some(tier);
        self
    }

    /// Allow a provider
    #[must_use]
    pub fn allow_provider(mut self, provider: impl Into<String>) -> Self {
        self.allowed_providers.push(provider.into());
        self
    }

    /// Deny a provider
    #[must_use]
    pub fn deny_provider(mut self, provider: impl Into<String>) -> Self {
        self.denied_providers.push(provider.into());
        self
    }

    /// Allow a model
    #[must_use]
    pub fn allow_model(mut self, model: impl Into<String>) -> Self {
        self.allowed_models.push(model.into());
        self
    }

    /// Deny a model
    #[must_use]
    pub fn deny_model(mut self, model: impl Into<String>) -> Self {
        self.denied_models.push(model.into());
        self
    }

    /// Require a specialization
    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Require a minimum context window
    #[must_use]
    pub fn with_min_context_window(mut self, tokens: u32) -> Self {
        self.min_context_window = Some(tokens);
        self
    }

    /// Require features
    #[must_use]
    pub fn with_required_features(mut self, features: FeatureSet) -> Self {
        self.required_features = features;
        self
    }

    /// Overlay `other` on top of `self`; set fields in `other` win, lists concatenate
    #[must_use]
    pub fn merged(&self, other: &RoutingConstraints) -> Self {
        let concat = |a: &[String], b: &[String]| -> Vec<String> { a.iter().chain(b).cloned().collect() };
        let f = &other.required_features;
        let s = &self.required_features;
        Self {
            max_cost_per_request: other.max_cost_per_request.or(self.max_cost_per_request),
            max_latency: other.max_latency.or(self.max_latency),
            min_quality: other.min_quality.or(self.min_quality),
            allowed_providers: concat(&self.allowed_providers, &other.allowed_providers),
            denied_providers: concat(&self.denied_providers, &other.denied_providers),
            allowed_models: concat(&self.allowed_models, &other.allowed_models),
            denied_models: concat(&self.denied_models, &other.denied_models),
            task_type: other.task_type.clone().or_else(|| self.task_type.clone()),
            min_context_window: other.min_context_window.or(self.min_context_window),
            required_features: FeatureSet {
                vision: s.vision || f.vision,
                function_calling: s.function_calling || f.function_calling,
                json_mode: s.json_mode || f.json_mode,
                streaming: s.streaming || f.streaming,
            },
        }
    }

    /// First constraint `model` violates for `request`, if any
    #[must_use]
    pub fn violation(&self, model: &ModelDefinition, request: &RequestEnvelope) -> Option<ConstraintViolation> {
        if !model.available {
            return Some(ConstraintViolation::Unavailable);
        }

        if let Some(max) = self.max_cost_per_request {
            let estimated = model.estimate_cost(request);
            if estimated > max {
                return Some(ConstraintViolation::Cost { estimated, max });
            }
        }

        if let Some(max) = self.max_latency {
            let estimated = model.estimated_latency();
            if estimated > max {
                return Some(ConstraintViolation::Latency { estimated, max });
            }
        }

        if let Some(min) = self.min_quality {
            if model.quality_tier < min {
                return Some(ConstraintViolation::Quality {
                    tier: model.quality_tier,
                    min,
                });
            }
        }

        let provider = model.id.provider();
        if (!self.allowed_providers.is_empty() && !listed(&self.allowed_providers, provider))
            || listed(&self.denied_providers, provider)
        {
            return Some(ConstraintViolation::Provider);
        }

        let full = model.id.to_string();
        let name_matches = |list: &[String]| listed(list, model.id.model()) || listed(list, &full);
        if (!self.allowed_models.is_empty() && !name_matches(&self.allowed_models))
            || name_matches(&self.denied_models)
        {
            return Some(ConstraintViolation::Model);
        }

        if let Some(task) = self.task_type.as_deref() {
            if !model.capabilities.specializes_in(task) {
                return Some(ConstraintViolation::TaskType(task.to_string()));
            }
        }

        let window = model.capabilities.context_window;
        let needed = self
            .min_context_window
            .unwrap_or(0)
            .max(request.estimated_input_tokens());
        if window < needed {
            return Some(ConstraintViolation::ContextWindow { window, needed });
        }

        let mut required = request.effective_features();
        required.json_mode |= self.required_features.json_mode;
        required.streaming |= self.required_features.streaming;
        required.vision |= self.required_features.vision;
        required.function_calling |= self.required_features.function_calling;
        if !model.capabilities.features.satisfies(&required) {
            return Some(ConstraintViolation::Features);
        }

        None
    }

    /// Whether `model` satisfies every constraint for `request`
    #[must_use]
    pub fn matches(&self, model: &ModelDefinition, request: &RequestEnvelope) -> bool {
        self.violation(model, request).is_none()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendId;

    fn model(provider: &str, name: &str) -> ModelDefinition {
        ModelDefinition::new(BackendId::new(provider, name))
    }

    #[test]
    fn test_empty_constraints_match_available() {
        let request = RequestEnvelope::user("hi");
        assert!(RoutingConstraints::new().matches(&model("p", "m"), &request));

        let mut down = model("p", "m");
        down.available = false;
        assert_eq!(
            RoutingConstraints::new().violation(&down, &request),
            Some(ConstraintViolation::Unavailable)
        );
    }

    #[test]
    fn test_cost_limit() {
        let request = RequestEnvelope::user("hello");
        let expensive = model("p", "a").with_pricing(0.02, 0.02);
        let cheap = model("p", "b").with_pricing(0.005, 0.005);
        let constraints = RoutingConstraints::new().with_max_cost(0.01);

        assert!(matches!(
            constraints.violation(&expensive, &request),
            Some(ConstraintViolation::Cost { .. })
        ));
        assert!(constraints.matches(&cheap, &request));
    }

    #[test]
    fn test_provider_and_model_lists() {
        let request = RequestEnvelope::user("hi");
        let openai = model("openai", "gpt-4o");
        let anthropic = model("anthropic", "claude");

        let allow = RoutingConstraints::new().allow_provider("openai");
        assert!(allow.matches(&openai, &request));
        assert_eq!(allow.violation(&anthropic, &request), Some(ConstraintViolation::Provider));

        let deny = RoutingConstraints::new().deny_model("openai/gpt-4o");
        assert_eq!(deny.violation(&openai, &request), Some(ConstraintViolation::Model));
        assert!(deny.matches(&anthropic, &request));

        let by_name = RoutingConstraints::new().allow_model("claude");
        assert!(by_name.matches(&anthropic, &request));
    }

    #[test]
    fn test_quality_and_task_type() {
        let request = RequestEnvelope::user("hi");
        let coder = model("p", "coder")
            .with_quality_tier(QualityTier::Standard)
            .with_specialization("code");

        let premium = RoutingConstraints::new().with_min_quality(QualityTier::Premium);
        assert!(matches!(
            premium.violation(&coder, &request),
            Some(ConstraintViolation::Quality { .. })
        ));

        assert!(RoutingConstraints::new().with_task_type("code").matches(&coder, &request));
        assert_eq!(
            RoutingConstraints::new()
                .with_task_type("vision")
                .violation(&coder, &request),
            Some(ConstraintViolation::TaskType("vision".into()))
        );
    }

    #[test]
    fn test_features_and_context() {
        let text_only = model("p", "m").with_context_window(1000);
        let images = RequestEnvelope::new(vec![crate::backend::ChatMessage::user("look").with_image()]);
        assert_eq!(
            RoutingConstraints::new().violation(&text_only, &images),
            Some(ConstraintViolation::Features)
        );

        let long = RequestEnvelope::user("x".repeat(8000));
        assert!(matches!(
            RoutingConstraints::new().violation(&text_only, &long),
            Some(ConstraintViolation::ContextWindow { needed: 2000, .. })
        ));
    }

    #[test]
    fn test_merge_prefers_overlay() {
        let base = RoutingConstraints::new().with_max_cost(1.0).deny_provider("x");
        let overlay = RoutingConstraints::new()
            .with_max_cost(0.1)
            .with_min_quality(QualityTier::Premium);
        let merged = base.merged(&overlay);
        assert_eq!(merged.max_cost_per_request, Some(0.1));
        assert_eq!(merged.min_quality, Some(QualityTier::Premium));
        assert_eq!(merged.denied_providers, vec!["x".to_string()]);
    }
}
