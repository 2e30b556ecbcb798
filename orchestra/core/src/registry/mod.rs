//! Model Registry
//!
//! Catalog of backends with their capabilities, pricing, and live metrics.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!   register  ──> │ DashMap<BackendId, ModelDefinition>  │ <── record_outcome
//!                 │   (one shard lock per key)           │     (orchestrator)
//!                 └──────────────────┬───────────────────┘
//!                                    │ find(constraints, request)
//!                                    v
//!                          matching, available models
//! ```
//!
//! Metrics updates go through `DashMap::get_mut`, so the read-modify-write of
//! a running average is atomic per backend while unrelated backends proceed
//! in parallel.

mod constraints;
mod model;

pub use constraints::{ConstraintViolation, RoutingConstraints};
pub use model::{CallOutcome, Capabilities, LiveMetrics, ModelDefinition, Pricing, QualityTier};

use dashmap::DashMap;

use crate::backend::{BackendId, FeatureSet, RequestEnvelope};

/// Thread-safe model catalog
#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<BackendId, ModelDefinition>,
}

impl ModelRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with [`builtin_models`]
    #[must_use]
    pub fn with_builtin_models() -> Self {
        let registry = Self::new();
        for model in builtin_models() {
            registry.register(model);
        }
        registry
    }

    /// Add or replace a model
    pub fn register(&self, model: ModelDefinition) {
        tracing::debug!(backend = %model.id, tier = %model.quality_tier, "Registered model");
        self.models.insert(model.id.clone(), model);
    }

    /// Remove a model
    pub fn unregister(&self, backend: &BackendId) -> Option<ModelDefinition> {
        self.models.remove(backend).map(|(_, model)| model)
    }

    /// Snapshot of one model
    #[must_use]
    pub fn get(&self, backend: &BackendId) -> Option<ModelDefinition> {
        self.models.get(backend).map(|m| m.clone())
    }

    /// Whether a model is registered
    #[must_use]
    pub fn contains(&self, backend: &BackendId) -> bool {
        self.models.contains_key(backend)
    }

    /// Number of registered models
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// True when no models are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Every model, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<ModelDefinition> {
        let mut models: Vec<_> = self.models.iter().map(|m| m.value().clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Mark a model available or not; false if unknown
    pub fn set_available(&self, backend: &BackendId, available: bool) -> bool {
        match self.models.get_mut(backend) {
            Some(mut model) => {
                if model.available != available {
                    tracing::info!(backend = %backend, available, "Model availability changed");
                }
                model.available = available;
                true
            }
            None => false,
        }
    }

    /// Available models matching `constraints` for `request`, sorted by id
    #[must_use]
    pub fn find(&self, constraints: &RoutingConstraints, request: &RequestEnvelope) -> Vec<ModelDefinition> {
        let mut matching: Vec<_> = self
            .models
            .iter()
            .filter_map(|entry| match constraints.violation(entry.value(), request) {
                None => Some(entry.value().clone()),
                Some(reason) => {
                    tracing::trace!(backend = %entry.key(), %reason, "Candidate rejected");
                    None
                }
            })
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    /// Cost of a call in USD, or `None` for an unknown backend
    #[must_use]
    pub fn calculate_cost(&self, backend: &BackendId, input_tokens: u32, output_tokens: u32) -> Option<f64> {
        self.models
            .get(backend)
            .map(|m| m.pricing.cost(input_tokens, output_tokens))
    }

    /// Fold a completed call into the model's live metrics
    pub fn record_outcome(&self, backend: &BackendId, outcome: &CallOutcome) {
        if let Some(mut model) = self.models.get_mut(backend) {
            model.metrics.record(outcome);
        }
    }

    /// Live metrics for one model
    #[must_use]
    pub fn metrics(&self, backend: &BackendId) -> Option<LiveMetrics> {
        self.models.get(backend).map(|m| m.metrics.clone())
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.len())
            .finish()
    }
}

// ============================================================================
// Built-in Catalog
// ============================================================================

fn chat_features(vision: bool) -> FeatureSet {
    FeatureSet {
        vision,
        function_calling: true,
        json_mode: true,
        streaming: true,
    }
}

/// Commonly used hosted models with list pricing per 1K tokens
#[must_use]
pub fn builtin_models() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition::new(BackendId::new("openai", "gpt-4o"))
            .with_display_name("GPT-4o")
            .with_pricing(0.0025, 0.01)
            .with_quality_tier(QualityTier::Premium)
            .with_context_window(128_000)
            .with_features(chat_features(true))
            .with_specialization("code")
            .with_specialization("reasoning"),
        ModelDefinition::new(BackendId::new("openai", "gpt-4o-mini"))
            .with_display_name("GPT-4o mini")
            .with_pricing(0.000_15, 0.0006)
            .with_quality_tier(QualityTier::Standard)
            .with_context_window(128_000)
            .with_features(chat_features(true)),
        ModelDefinition::new(BackendId::new("anthropic", "claude-3-5-sonnet"))
            .with_display_name("Claude 3.5 Sonnet")
            .with_pricing(0.003, 0.015)
            .with_quality_tier(QualityTier::Premium)
            .with_context_window(200_000)
            .with_features(chat_features(true))
            .with_specialization("code")
            .with_specialization("writing"),
        ModelDefinition::new(BackendId::new("anthropic", "claude-3-opus"))
            .with_display_name("Claude 3 Opus")
            .with_pricing(0.015, 0.075)
            .with_quality_tier(QualityTier::Enterprise)
            .with_context_window(200_000)
            .with_features(chat_features(true))
            .with_specialization("reasoning"),
        ModelDefinition::new(BackendId::new("anthropic", "claude-3-haiku"))
            .with_display_name("Claude 3 Haiku")
            .with_pricing(0.000_25, 0.001_25)
            .with_quality_tier(QualityTier::Economy)
            .with_context_window(200_000)
            .with_features(chat_features(true)),
        ModelDefinition::new(BackendId::new("google", "gemini-1.5-pro"))
            .with_display_name("Gemini 1.5 Pro")
            .with_pricing(0.001_25, 0.005)
            .with_quality_tier(QualityTier::Premium)
            .with_context_window(2_000_000)
            .with_features(chat_features(true))
            .with_specialization("long-context"),
        ModelDefinition::new(BackendId::new("ollama", "llama3"))
            .with_display_name("Llama 3 (local)")
            .with_quality_tier(QualityTier::Economy)
            .with_context_window(8192)
            .with_features(FeatureSet {
                streaming: true,
                ..FeatureSet::default()
            }),
    ]
}

// ============================================================================
// Tests
// ============================================================================
