//! Model definitions
//!
//! Static description of a backend (capabilities, pricing, quality tier)
//! plus the live metrics the orchestrator folds in after every call.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, FeatureSet, RequestEnvelope};

// ============================================================================
// Quality Tier
// ============================================================================

/// Coarse quality ranking of a model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Cheap, fast, limited
    Economy,
    /// General purpose
    #[default]
    Standard,
    /// Strong reasoning
    Premium,
    /// Top of the line
    Enterprise,
}

impl QualityTier {
    /// Tier mapped onto `[0.25, 1.0]`
    #[must_use]
    pub fn score(self) -> f64 {
        match self {
            Self::Economy => 0.25,
            Self::Standard => 0.5,
            Self::Premium => 0.75,
            Self::Enterprise => 1.0,
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Capabilities & Pricing
// ============================================================================

/// What a model can do
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Context window in tokens
    pub context_window: u32,

    /// Optional features
    #[serde(flatten)]
    pub features: FeatureSet,

    /// Task types the model is tuned for (`code`, `reasoning`, ...)
    pub specializations: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            context_window: 8192,
            features: FeatureSet {
                streaming: true,
                ..FeatureSet::default()
            },
            specializations: Vec::new(),
        }
    }
}

impl Capabilities {
    /// Whether `task_type` is one of the model's specializations
    #[must_use]
    pub fn specializes_in(&self, task_type: &str) -> bool {
        self.specializations
            .iter()
            .any(|s| s.eq_ignore_ascii_case(task_type))
    }
}

/// Price per 1K tokens in USD
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Input (prompt) tokens
    pub input_per_1k: f64,
    /// Output (completion) tokens
    pub output_per_1k: f64,
}

impl Pricing {
    /// Create pricing
    #[must_use]
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Cost of a call with the given token counts
    #[must_use]
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        f64::from(input_tokens) / 1000.0 * self.input_per_1k
            + f64::from(output_tokens) / 1000.0 * self.output_per_1k
    }

    /// Combined per-1K price, used to rank by cost
    #[must_use]
    pub fn combined_per_1k(&self) -> f64 {
        self.input_per_1k + self.output_per_1k
    }
}

// ============================================================================
// Live Metrics
// ============================================================================

/// Outcome of one completed call, reported by the orchestrator
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CallOutcome {
    /// The call succeeded
    pub success: bool,
    /// Wall-clock latency
    pub latency: Duration,
    /// Computed cost in USD
    pub cost: f64,
    /// Quality score in `[0, 1]`, when the executor supplied one
    pub quality: Option<f64>,
}

impl CallOutcome {
    /// Successful call
    #[must_use]
    pub fn success(latency: Duration, cost: f64) -> Self {
        Self {
            success: true,
            latency,
            cost,
            quality: None,
        }
    }

    /// Failed call
    #[must_use]
    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            latency,
            cost: 0.0,
            quality: None,
        }
    }

    /// Attach a quality score
    #[must_use]
    pub fn with_quality(mut self, quality: Option<f64>) -> Self {
        self.quality = quality;
        self
    }
}

/// Running averages observed for one model
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveMetrics {
    /// Completed calls
    pub total_requests: u64,
    /// Successful calls
    pub successful_requests: u64,
    /// Mean latency of all calls, milliseconds
    pub avg_latency_ms: f64,
    /// Mean cost of successful calls
    pub avg_cost: f64,
    /// Mean quality of calls that reported one
    pub avg_quality: Option<f64>,
    /// Calls that reported a quality score
    pub quality_samples: u64,
    /// When the model last completed a call
    pub last_used: Option<DateTime<Utc>>,
}

impl LiveMetrics {
    /// Fold one outcome into the averages
    pub fn record(&mut self, outcome: &CallOutcome) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        let latency_ms = outcome.latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;

        if outcome.success {
            self.successful_requests += 1;
            let s = self.successful_requests as f64;
            self.avg_cost += (outcome.cost - self.avg_cost) / s;
        }

        if let Some(quality) = outcome.quality {
            self.quality_samples += 1;
            let q = self.quality_samples as f64;
            let prev = self.avg_quality.unwrap_or(0.0);
            self.avg_quality = Some(prev + (quality - prev) / q);
        }

        self.last_used = Some(Utc::now());
    }

    /// Success ratio; 1.0 before any call
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

// ============================================================================
// Model Definition
// ============================================================================

/// Registry entry for one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Backend identity
    pub id: BackendId,

    /// Human-readable name
    #[serde(default)]
    pub display_name: String,

    /// Capabilities
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Token pricing
    #[serde(default)]
    pub pricing: Pricing,

    /// Quality tier
    #[serde(default)]
    pub quality_tier: QualityTier,

    /// Latency assumed until calls have been observed, milliseconds
    #[serde(default = "default_expected_latency_ms")]
    pub expected_latency_ms: u64,

    /// Load balancer weight
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Whether the model may be selected
    #[serde(default = "default_available")]
    pub available: bool,

    /// Observed metrics
    #[serde(default)]
    pub metrics: LiveMetrics,
}

fn default_expected_latency_ms() -> u64 {
    1000
}

fn default_weight() -> u32 {
    1
}

fn default_available() -> bool {
    true
}

impl ModelDefinition {
    /// Create a definition with default capabilities and zero pricing
    pub fn new(id: BackendId) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            capabilities: Capabilities::default(),
            pricing: Pricing::default(),
            quality_tier: QualityTier::Standard,
            expected_latency_ms: default_expected_latency_ms(),
            weight: default_weight(),
            available: true,
            metrics: LiveMetrics::default(),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set pricing per 1K tokens
    #[must_use]
    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.pricing = Pricing::new(input_per_1k, output_per_1k);
        self
    }

    /// Set the quality tier
    #[must_use]
    pub fn with_quality_tier(mut self, tier: QualityTier) -> Self {
        self.quality_tier = tier;
        self
    }

    /// Set the context window
    #[must_use]
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.capabilities.context_window = tokens;
        self
    }

    /// Set supported features
    #[must_use]
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.capabilities.features = features;
        self
    }

    /// Add a specialization
    #[must_use]
    pub fn with_specialization(mut self, task_type: impl Into<String>) -> Self {
        self.capabilities.specializations.push(task_type.into());
        self
    }

    /// Set the prior latency
    #[must_use]
    pub fn with_expected_latency(mut self, latency: Duration) -> Self {
        self.expected_latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the load balancer weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Estimated cost of serving `request`
    #[must_use]
    pub fn estimate_cost(&self, request: &RequestEnvelope) -> f64 {
        self.pricing.cost(
            request.estimated_input_tokens(),
            request.expected_output_tokens(),
        )
    }

    /// Observed mean latency, or the prior before any call
    #[must_use]
    pub fn estimated_latency(&self) -> Duration {
        if self.metrics.total_requests == 0 {
            Duration::from_millis(self.expected_latency_ms)
        } else {
            Duration::from_secs_f64(self.metrics.avg_latency_ms / 1000.0)
        }
    }

    /// Observed quality, or the tier score before any report
    #[must_use]
    pub fn quality_score(&self) -> f64 {
        self.metrics
            .avg_quality
            .unwrap_or_else(|| self.quality_tier.score())
    }
}

// ============================================================================
// Tests
// ============================================================================
