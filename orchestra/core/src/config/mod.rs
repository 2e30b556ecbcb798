//! TOML Configuration File Support
//!
//! Centralized configuration loading for the orchestrator, from a TOML file
//! at `~/.config/orchestra/orchestra.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. Programmatic overrides ([`ConfigOverrides`])
//! 2. Environment variables (`ORCHESTRA_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! log_filter = "orchestra_core=debug"
//! include_builtin_models = true
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 30000
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! retry_on = ["rate_limit", "timeout", "server_error", "network_error"]
//!
//! [rate_limit]
//! requests_per_minute = 600
//!
//! [rate_limit.backends."openai/gpt-4o"]
//! requests_per_second = 5
//!
//! [queue]
//! max_concurrency = 5
//! timeout_ms = 60000
//!
//! [fallback]
//! backends = ["openai/gpt-4o", "anthropic/claude-3-5-sonnet"]
//! max_retries = 2
//!
//! [router]
//! default_strategy = "balanced"
//! adaptive_min_samples = 10
//!
//! [[models]]
//! id = "acme/fast"
//! pricing = { input_per_1k = 0.001, output_per_1k = 0.002 }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendId, ErrorKind, Priority};
use crate::registry::ModelDefinition;
use crate::resilience::{
    CircuitBreakerConfig, FallbackConfig, QueueConfig, RateLimiterConfig, RateLimits, RetryConfig,
};
use crate::routing::{RouterConfig, RoutingRule, RoutingStrategy, ScoringWeights};

/// Default `tracing` filter directive
pub const DEFAULT_LOG_FILTER: &str = "orchestra_core=info";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration last changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Programmatic override
    Override,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[circuit_breaker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerToml {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,
    /// Failure percentage (0-100) that opens the circuit
    pub failure_rate_threshold: Option<f64>,
    /// Failure-rate window in milliseconds
    pub failure_rate_window_ms: Option<u64>,
    /// Outcomes needed before the rate is evaluated
    pub minimum_requests: Option<u32>,
    /// Open duration in milliseconds
    pub reset_timeout_ms: Option<u64>,
    /// Half-open successes needed to close
    pub success_threshold: Option<u32>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,
    /// First retry delay in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Delay cap in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Growth factor
    pub backoff_multiplier: Option<f64>,
    /// Randomise delays
    pub jitter: Option<bool>,
    /// Retryable error kinds
    pub retry_on: Option<Vec<ErrorKind>>,
    /// Respect provider `retry-after`
    pub honor_retry_after: Option<bool>,
}

/// `[rate_limit]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Default per-second limit
    pub requests_per_second: Option<u32>,
    /// Default per-minute limit
    pub requests_per_minute: Option<u32>,
    /// Honour provider quota hints
    pub auto_throttle: Option<bool>,
    /// Waiting callers per backend
    pub max_queue_size: Option<usize>,
    /// Longest wait for a slot, in milliseconds
    pub acquire_timeout_ms: Option<u64>,
    /// Per-backend limits
    pub backends: HashMap<BackendId, BackendLimitsToml>,
}

/// One entry of `[rate_limit.backends]`
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendLimitsToml {
    /// Per-second limit
    pub requests_per_second: Option<u32>,
    /// Per-minute limit
    pub requests_per_minute: Option<u32>,
}

/// `[queue]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueToml {
    /// Concurrent requests per backend
    pub max_concurrency: Option<usize>,
    /// Priority for requests without one
    pub default_priority: Option<Priority>,
    /// Request deadline in milliseconds
    pub timeout_ms: Option<u64>,
    /// Waiting-list cap
    pub max_queue_size: Option<usize>,
    /// Per-backend concurrency overrides
    pub backends: HashMap<BackendId, usize>,
    /// Route `chat` through the queue
    pub queue_chats: Option<bool>,
}

/// `[fallback]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackToml {
    /// Chain order
    pub backends: Option<Vec<BackendId>>,
    /// Retries per backend
    pub max_retries: Option<u32>,
    /// Per-backend retry overrides
    pub backend_retries: HashMap<BackendId, u32>,
    /// Pause between tries in milliseconds
    pub retry_delay_ms: Option<u64>,
}

/// `[router]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Strategy when the request sets no goal
    pub default_strategy: Option<RoutingStrategy>,
    /// Balanced-strategy weights
    pub weights: Option<ScoringWeights>,
    /// Learn from outcomes
    pub adaptive_learning: Option<bool>,
    /// Samples before a learned preference is used
    pub adaptive_min_samples: Option<u64>,
    /// Cache decisions
    pub cache_decisions: Option<bool>,
    /// Decision cache TTL in seconds
    pub decision_cache_ttl_secs: Option<u64>,
    /// Sticky session TTL in seconds
    pub sticky_session_ttl_secs: Option<u64>,
    /// Routing rules
    pub rules: Vec<RoutingRule>,
}

/// Complete TOML configuration file structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraToml {
    /// `tracing` filter directive
    pub log_filter: Option<String>,
    /// Seed the registry with the built-in catalog
    pub include_builtin_models: Option<bool>,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerToml,
    /// Retry settings
    pub retry: RetryToml,
    /// Rate limiter settings
    pub rate_limit: RateLimitToml,
    /// Queue settings
    pub queue: QueueToml,
    /// Fallback chain
    pub fallback: FallbackToml,
    /// Router settings
    pub router: RouterToml,
    /// Extra model definitions
    pub models: Vec<ModelDefinition>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestraConfig {
    /// Circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Rate limiter defaults
    pub rate_limiter: RateLimiterConfig,
    /// Per-backend rate limits
    pub backend_limits: HashMap<BackendId, RateLimits>,
    /// Request queue
    pub queue: QueueConfig,
    /// Per-backend queue concurrency
    pub backend_concurrency: HashMap<BackendId, usize>,
    /// Route `chat` through the queue
    pub queue_chats: bool,
    /// Configured fallback chain; may be empty
    pub fallback: FallbackConfig,
    /// Router
    pub router: RouterConfig,
    /// Seed the registry with the built-in catalog
    pub include_builtin_models: bool,
    /// Models registered on top of (or instead of) the built-ins
    pub models: Vec<ModelDefinition>,
    /// `tracing` filter directive
    pub log_filter: String,
    /// File the configuration was read from
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for OrchestraConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            backend_limits: HashMap::new(),
            queue: QueueConfig::default(),
            backend_concurrency: HashMap::new(),
            queue_chats: true,
            fallback: FallbackConfig::default(),
            router: RouterConfig::default(),
            include_builtin_models: true,
            models: Vec::new(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl OrchestraConfig {
    /// Create configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration last changed
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Validation(msg)) };

        let rate = self.circuit_breaker.failure_rate_threshold;
        if !(0.0..=100.0).contains(&rate) {
            return invalid(format!("failure_rate_threshold must be 0-100, got {rate}"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1".into());
        }
        if self.circuit_breaker.success_threshold == 0 {
            return invalid("success_threshold must be at least 1".into());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid("retry base_delay exceeds max_delay".into());
        }
        if self.queue.max_concurrency == 0 {
            return invalid("queue max_concurrency must be at least 1".into());
        }
        if let Some((backend, _)) = self.backend_concurrency.iter().find(|(_, max)| **max == 0) {
            return invalid(format!("queue concurrency for {backend} must be at least 1"));
        }
        let w = self.router.weights;
        if [w.cost, w.quality, w.latency, w.reliability]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return invalid("router weights must be non-negative".into());
        }
        if !self.fallback.backends.is_empty() {
            self.fallback
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/orchestra/orchestra.toml`, typically
/// `~/.config/orchestra/orchestra.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("orchestra").join("orchestra.toml"))
}

/// Load configuration from the default path plus environment
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config() -> Result<OrchestraConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from `path` (if it exists) plus environment
///
/// A missing file is not an error; defaults are used.
///
/// # Errors
///
/// [`ConfigError::Read`] or [`ConfigError::Parse`] for a bad file,
/// [`ConfigError::Validation`] for out-of-range values.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<OrchestraConfig, ConfigError> {
    let mut config = OrchestraConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: OrchestraToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Parse a TOML string into configuration (no file, no environment)
///
/// # Errors
///
/// [`ConfigError::Parse`] or [`ConfigError::Validation`].
pub fn parse_config(toml_content: &str) -> Result<OrchestraConfig, ConfigError> {
    let mut config = OrchestraConfig::default();
    apply_toml_config(&mut config, toml::from_str(toml_content)?);
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn limits(rps: Option<u32>, rpm: Option<u32>) -> RateLimits {
    let mut limits = RateLimits::new();
    if let Some(rps) = rps {
        limits = limits.with_requests_per_second(rps);
    }
    if let Some(rpm) = rpm {
        limits = limits.with_requests_per_minute(rpm);
    }
    limits
}

fn apply_toml_config(config: &mut OrchestraConfig, toml: OrchestraToml) {
    if let Some(filter) = toml.log_filter {
        config.log_filter = filter;
    }
    if let Some(builtin) = toml.include_builtin_models {
        config.include_builtin_models = builtin;
    }

    // Circuit breaker
    let cb = &toml.circuit_breaker;
    let target = &mut config.circuit_breaker;
    if let Some(v) = cb.failure_threshold {
        target.failure_threshold = v;
    }
    if let Some(v) = cb.failure_rate_threshold {
        target.failure_rate_threshold = v;
    }
    if let Some(v) = cb.failure_rate_window_ms {
        target.failure_rate_window = ms(v);
    }
    if let Some(v) = cb.minimum_requests {
        target.minimum_requests = v;
    }
    if let Some(v) = cb.reset_timeout_ms {
        target.reset_timeout = ms(v);
    }
    if let Some(v) = cb.success_threshold {
        target.success_threshold = v;
    }

    // Retry
    let retry = toml.retry;
    if let Some(v) = retry.max_retries {
        config.retry.max_retries = v;
    }
    if let Some(v) = retry.base_delay_ms {
        config.retry.base_delay = ms(v);
    }
    if let Some(v) = retry.max_delay_ms {
        config.retry.max_delay = ms(v);
    }
    if let Some(v) = retry.backoff_multiplier {
        config.retry.backoff_multiplier = v;
    }
    if let Some(v) = retry.jitter {
        config.retry.jitter = v;
    }
    if let Some(v) = retry.retry_on {
        config.retry.retry_on = v;
    }
    if let Some(v) = retry.honor_retry_after {
        config.retry.honor_retry_after = v;
    }

    // Rate limiter
    let rl = toml.rate_limit;
    if rl.requests_per_second.is_some() || rl.requests_per_minute.is_some() {
        config.rate_limiter.default_limits = limits(rl.requests_per_second, rl.requests_per_minute);
    }
    if let Some(v) = rl.auto_throttle {
        config.rate_limiter.auto_throttle = v;
    }
    if let Some(v) = rl.max_queue_size {
        config.rate_limiter.max_queue_size = v;
    }
    if let Some(v) = rl.acquire_timeout_ms {
        config.rate_limiter.acquire_timeout = ms(v);
    }
    for (backend, backend_limits) in rl.backends {
        config.backend_limits.insert(
            backend,
            limits(backend_limits.requests_per_second, backend_limits.requests_per_minute),
        );
    }

    // Queue
    let queue = toml.queue;
    if let Some(v) = queue.max_concurrency {
        config.queue.max_concurrency = v;
    }
    if let Some(v) = queue.default_priority {
        config.queue.default_priority = v;
    }
    if let Some(v) = queue.timeout_ms {
        config.queue.timeout = ms(v);
    }
    if let Some(v) = queue.max_queue_size {
        config.queue.max_queue_size = v;
    }
    if let Some(v) = queue.queue_chats {
        config.queue_chats = v;
    }
    config.backend_concurrency.extend(queue.backends);

    // Fallback
    let fb = toml.fallback;
    if let Some(v) = fb.backends {
        config.fallback.backends = v;
    }
    if let Some(v) = fb.max_retries {
        config.fallback.max_retries = v;
    }
    if let Some(v) = fb.retry_delay_ms {
        config.fallback.retry_delay = ms(v);
    }
    config.fallback.backend_retries.extend(fb.backend_retries);

    // Router
    let router = toml.router;
    if let Some(v) = router.default_strategy {
        config.router.default_strategy = v;
    }
    if let Some(v) = router.weights {
        config.router.weights = v;
    }
    if let Some(v) = router.adaptive_learning {
        config.router.adaptive_learning = v;
    }
    if let Some(v) = router.adaptive_min_samples {
        config.router.adaptive_min_samples = v;
    }
    if let Some(v) = router.cache_decisions {
        config.router.cache_decisions = v;
    }
    if let Some(v) = router.decision_cache_ttl_secs {
        config.router.decision_cache_ttl = Duration::from_secs(v);
    }
    if let Some(v) = router.sticky_session_ttl_secs {
        config.router.sticky_session_ttl = Duration::from_secs(v);
    }
    config.router.rules.extend(router.rules);

    config.models.extend(toml.models);
}

/// Parse `raw`, warning and returning `None` when it does not parse
fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = raw, "Ignoring unparseable environment override");
    }
    parsed
}

fn parse_bool(raw: &str) -> bool {
    let raw = raw.trim();
    raw != "0" && !raw.eq_ignore_ascii_case("false")
}

/// Apply `ORCHESTRA_*` overrides read through `lookup`
fn apply_env_config<F>(config: &mut OrchestraConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(raw) = lookup("ORCHESTRA_LOG") {
        config.log_filter = raw;
        touched = true;
    }
    if let Some(raw) = lookup("ORCHESTRA_DEFAULT_STRATEGY") {
        if let Some(strategy) = parse_env::<RoutingStrategy>("ORCHESTRA_DEFAULT_STRATEGY", &raw) {
            config.router.default_strategy = strategy;
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_ADAPTIVE_LEARNING") {
        config.router.adaptive_learning = parse_bool(&raw);
        touched = true;
    }
    if let Some(raw) = lookup("ORCHESTRA_MAX_RETRIES") {
        if let Some(n) = parse_env("ORCHESTRA_MAX_RETRIES", &raw) {
            config.retry.max_retries = n;
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_FAILURE_THRESHOLD") {
        if let Some(n) = parse_env("ORCHESTRA_FAILURE_THRESHOLD", &raw) {
            config.circuit_breaker.failure_threshold = n;
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_RESET_TIMEOUT_MS") {
        if let Some(n) = parse_env("ORCHESTRA_RESET_TIMEOUT_MS", &raw) {
            config.circuit_breaker.reset_timeout = ms(n);
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_MAX_CONCURRENCY") {
        if let Some(n) = parse_env("ORCHESTRA_MAX_CONCURRENCY", &raw) {
            config.queue.max_concurrency = n;
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_QUEUE_TIMEOUT_MS") {
        if let Some(n) = parse_env("ORCHESTRA_QUEUE_TIMEOUT_MS", &raw) {
            config.queue.timeout = ms(n);
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_REQUESTS_PER_SECOND") {
        if let Some(n) = parse_env::<u32>("ORCHESTRA_REQUESTS_PER_SECOND", &raw) {
            config.rate_limiter.default_limits = config
                .rate_limiter
                .default_limits
                .with_requests_per_second(n);
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_REQUESTS_PER_MINUTE") {
        if let Some(n) = parse_env::<u32>("ORCHESTRA_REQUESTS_PER_MINUTE", &raw) {
            config.rate_limiter.default_limits = config
                .rate_limiter
                .default_limits
                .with_requests_per_minute(n);
            touched = true;
        }
    }
    if let Some(raw) = lookup("ORCHESTRA_FALLBACK") {
        let chain: Result<Vec<BackendId>, _> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect();
        match chain {
            Ok(chain) => {
                config.fallback.backends = chain;
                touched = true;
            }
            Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid ORCHESTRA_FALLBACK"),
        }
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Programmatic Overrides
// =============================================================================

/// Overrides applied on top of file and environment values
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default routing strategy
    pub default_strategy: Option<RoutingStrategy>,
    /// Retry budget
    pub max_retries: Option<u32>,
    /// Queue concurrency per backend
    pub max_concurrency: Option<usize>,
    /// Fallback chain
    pub fallback: Option<Vec<BackendId>>,
    /// `tracing` filter
    pub log_filter: Option<String>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default strategy
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Set the retry budget
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the queue concurrency
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// Set the fallback chain
    #[must_use]
    pub fn with_fallback(mut self, backends: Vec<BackendId>) -> Self {
        self.fallback = Some(backends);
        self
    }

    /// Set the log filter
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Apply to `config`
    pub fn apply(&self, config: &mut OrchestraConfig) {
        if self.default_strategy.is_some()
            || self.max_retries.is_some()
            || self.max_concurrency.is_some()
            || self.fallback.is_some()
            || self.log_filter.is_some()
        {
            config.source = ConfigSource::Override;
        }

        if let Some(strategy) = self.default_strategy {
            config.router.default_strategy = strategy;
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
        if let Some(max) = self.max_concurrency {
            config.queue.max_concurrency = max;
        }
        if let Some(ref chain) = self.fallback {
            config.fallback.backends = chain.clone();
        }
        if let Some(ref filter) = self.log_filter {
            config.log_filter = filter.clone();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
