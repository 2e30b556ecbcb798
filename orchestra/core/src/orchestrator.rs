//! Orchestrator
//!
//! Composes the registry, router, and resilience primitives around a single
//! [`BackendExecutor`].
//!
//! # Call Pipeline
//!
//! ```text
//! chat(request)
//!   │
//!   ├─ route ─────────────> RoutingDecision { backend, alternatives }
//!   │
//!   └─ fallback over [backend, alternatives..]
//!         │
//!         └─ queue (optional) ─> circuit breaker ─> rate limiter ─> retry ─> executor
//!                                                                         │
//!            cost, latency, retry metadata, quota hint  <─────────────────┘
//!            registry metrics, adaptive learning, orchestrator metrics
//! ```
//!
//! A whole retry sequence counts as one circuit breaker outcome. Requests
//! rejected by the breaker, the rate limiter, or the queue never reach the
//! executor and are not fed to adaptive learning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{BackendExecutor, BackendId, ErrorKind, RequestEnvelope, ResponseEnvelope};
use crate::config::{ConfigError, OrchestraConfig};
use crate::error::OrchestraError;
use crate::metrics::{MetricsSnapshot, OrchestratorMetrics, Rejection};
use crate::registry::{CallOutcome, ModelDefinition, ModelRegistry, RoutingConstraints};
use crate::resilience::{
    AttemptFn, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigPatch, CircuitError,
    CircuitEvent, CircuitState, CircuitStats, EnqueueOptions, FailureRecord, FallbackConfig,
    FallbackManager, FallbackResponse, QueueConfig, QueueHandler, QueueStats, RateLimiter,
    RateLimiterConfig, RateLimits, RequestQueue, RetryConfig, RetryMetadata, RetryPolicy,
};
use crate::routing::{ModelRouter, RouterConfig, RouterStats, RoutingDecision, RoutingRule};

// ============================================================================
// Pipeline
// ============================================================================

/// Everything a single backend call needs; shared with the queue handler
struct Pipeline {
    registry: Arc<ModelRegistry>,
    router: Arc<ModelRouter>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    executor: Arc<dyn BackendExecutor>,
    metrics: Arc<OrchestratorMetrics>,
}

/// Releases a least-connections slot when the call ends or is dropped
struct ConnectionGuard<'a> {
    router: &'a ModelRouter,
    backend: &'a BackendId,
}

impl<'a> ConnectionGuard<'a> {
    fn acquire(router: &'a ModelRouter, backend: &'a BackendId) -> Self {
        router.acquire_connection(backend);
        Self { router, backend }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.router.release_connection(self.backend);
    }
}

/// Invalid requests say nothing about backend health
fn counts_against_circuit(error: &OrchestraError) -> bool {
    match error {
        OrchestraError::Backend { source, .. } => source.error.kind != ErrorKind::InvalidRequest,
        _ => false,
    }
}

impl Pipeline {
    async fn execute(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, OrchestraError> {
        let _connection = ConnectionGuard::acquire(&self.router, backend);
        let start = Instant::now();

        let limiter = &self.limiter;
        let executor = &self.executor;
        let retry = &self.retry;
        let call = async move {
            limiter.acquire(backend).await?;
            retry
                .run(move |_attempt| async move {
                    let result = executor.execute(backend, request).await;
                    let hint = match &result {
                        Ok(response) => response.quota,
                        Err(error) => error.quota,
                    };
                    if let Some(hint) = hint {
                        limiter.update_from_hint(backend, hint);
                    }
                    result
                })
                .await
                .map_err(|source| OrchestraError::Backend {
                    backend: backend.clone(),
                    source,
                })
        };

        let result = self
            .breaker
            .execute_filtered(backend, call, counts_against_circuit)
            .await;
        let latency = start.elapsed();

        match result {
            Ok((response, retry)) => Ok(self.complete(backend, request, response, retry, latency)),
            Err(CircuitError::Open {
                backend,
                retry_after,
            }) => {
                self.metrics.record_rejection(&backend, Rejection::Circuit);
                Err(OrchestraError::CircuitOpen {
                    backend,
                    retry_after,
                })
            }
            Err(CircuitError::Inner(error)) => {
                self.fail(backend, request, &error, latency);
                Err(error)
            }
        }
    }

    fn complete(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
        mut response: ResponseEnvelope,
        retry: Option<RetryMetadata>,
        latency: Duration,
    ) -> ResponseEnvelope {
        if let Some(cost) = self.registry.calculate_cost(
            backend,
            response.usage.input_tokens,
            response.usage.output_tokens,
        ) {
            response.cost = cost;
        }
        response.latency = latency;
        let retries = retry.as_ref().map_or(0, RetryMetadata::retries);
        response.retry = retry;

        let outcome = CallOutcome::success(latency, response.cost).with_quality(response.quality);
        self.registry.record_outcome(backend, &outcome);
        self.router.record_outcome(request, backend, &outcome);
        self.metrics.record_request(backend);
        self.metrics.record_success(backend, latency, response.cost, retries);

        tracing::debug!(
            backend = %backend,
            request_id = %request.id,
            latency_ms = latency.as_millis() as u64,
            cost = response.cost,
            retries,
            "Request completed"
        );
        response
    }

    fn fail(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
        error: &OrchestraError,
        latency: Duration,
    ) {
        match error {
            OrchestraError::Backend { source, .. } => {
                let outcome = CallOutcome::failure(latency);
                self.registry.record_outcome(backend, &outcome);
                self.router.record_outcome(request, backend, &outcome);
                self.metrics.record_request(backend);
                self.metrics
                    .record_failure(backend, latency, source.metadata.retries());
            }
            OrchestraError::RateLimit(_) => {
                self.metrics.record_rejection(backend, Rejection::RateLimit);
            }
            _ => {}
        }
        tracing::warn!(
            backend = %backend,
            request_id = %request.id,
            subsystem = %error.subsystem(),
            error = %error,
            "Request failed"
        );
    }
}

// ============================================================================
// Chat Response
// ============================================================================

/// Result of [`Orchestrator::chat`]
#[derive(Clone, Debug)]
pub struct ChatResponse {
    /// Response from the backend that answered
    pub response: ResponseEnvelope,
    /// Routing decision the chain was built from
    pub decision: RoutingDecision,
    /// True when a backend other than the selection answered
    pub used_fallback: bool,
    /// Backends tried, in order
    pub attempted_backends: Vec<BackendId>,
    /// Failed tries before the success
    pub failures: Vec<FailureRecord>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    registry: Option<Arc<ModelRegistry>>,
    models: Vec<ModelDefinition>,
    router: RouterConfig,
    circuit_breaker: CircuitBreakerConfig,
    retry: Option<RetryPolicy>,
    rate_limiter: RateLimiterConfig,
    backend_limits: HashMap<BackendId, RateLimits>,
    queue: QueueConfig,
    backend_concurrency: HashMap<BackendId, usize>,
    queue_chats: Option<bool>,
    fallback: FallbackConfig,
    executor: Option<Arc<dyn BackendExecutor>>,
}

impl OrchestratorBuilder {
    /// Builder seeded from loaded configuration
    ///
    /// The registry holds the built-in catalog when
    /// `include_builtin_models` is set, plus every configured model.
    #[must_use]
    pub fn from_config(config: &OrchestraConfig) -> Self {
        let registry = if config.include_builtin_models {
            ModelRegistry::with_builtin_models()
        } else {
            ModelRegistry::new()
        };
        Self {
            registry: Some(Arc::new(registry)),
            models: config.models.clone(),
            router: config.router.clone(),
            circuit_breaker: config.circuit_breaker.clone(),
            retry: Some(RetryPolicy::new(config.retry.clone())),
            rate_limiter: config.rate_limiter.clone(),
            backend_limits: config.backend_limits.clone(),
            queue: config.queue.clone(),
            backend_concurrency: config.backend_concurrency.clone(),
            queue_chats: Some(config.queue_chats),
            fallback: config.fallback.clone(),
            executor: None,
        }
    }

    /// Use an existing registry
    #[must_use]
    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a model at build time
    #[must_use]
    pub fn model(mut self, model: ModelDefinition) -> Self {
        self.models.push(model);
        self
    }

    /// Router configuration
    #[must_use]
    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router = config;
        self
    }

    /// Circuit breaker configuration
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Retry configuration
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(RetryPolicy::new(config));
        self
    }

    /// Retry policy with hooks
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Rate limiter configuration
    #[must_use]
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Limits for one backend
    #[must_use]
    pub fn rate_limits(mut self, backend: BackendId, limits: RateLimits) -> Self {
        self.backend_limits.insert(backend, limits);
        self
    }

    /// Queue configuration
    #[must_use]
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Queue concurrency for one backend
    #[must_use]
    pub fn queue_concurrency(mut self, backend: BackendId, max: usize) -> Self {
        self.backend_concurrency.insert(backend, max);
        self
    }

    /// Send `chat` attempts through the queue (default on)
    #[must_use]
    pub fn queue_chats(mut self, enabled: bool) -> Self {
        self.queue_chats = Some(enabled);
        self
    }

    /// Chain used by [`Orchestrator::fallback`]
    #[must_use]
    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = config;
        self
    }

    /// Executor performing the real calls
    #[must_use]
    pub fn executor<X: BackendExecutor + 'static>(mut self, executor: X) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Shared executor
    #[must_use]
    pub fn executor_arc(mut self, executor: Arc<dyn BackendExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Assemble the orchestrator
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] when no executor was supplied or the
    /// fallback chain is invalid.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        let executor = self
            .executor
            .ok_or_else(|| ConfigError::Validation("an executor is required".into()))?;
        if !self.fallback.backends.is_empty() {
            self.fallback
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ModelRegistry::with_builtin_models()));
        for model in self.models {
            registry.register(model);
        }

        let limiter = Arc::new(RateLimiter::new(self.rate_limiter));
        for (backend, limits) in &self.backend_limits {
            limiter.set_limits(backend, *limits);
        }

        let pipeline = Arc::new(Pipeline {
            router: Arc::new(ModelRouter::new(Arc::clone(&registry), self.router)),
            registry,
            limiter,
            breaker: Arc::new(CircuitBreaker::new(self.circuit_breaker)),
            retry: self.retry.unwrap_or_default(),
            executor,
            metrics: Arc::new(OrchestratorMetrics::new()),
        });

        let for_queue = Arc::clone(&pipeline);
        let handler: QueueHandler<OrchestraError> = Arc::new(move |backend, request| {
            let pipeline = Arc::clone(&for_queue);
            Box::pin(async move { pipeline.execute(&backend, &request).await })
        });
        let queue = RequestQueue::new(self.queue, handler);
        for (backend, max) in &self.backend_concurrency {
            queue.set_max_concurrency(backend, *max);
        }

        tracing::info!(
            executor = pipeline.executor.name(),
            models = pipeline.registry.len(),
            fallback_backends = self.fallback.backends.len(),
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            pipeline,
            queue,
            fallback: self.fallback,
            queue_chats: self.queue_chats.unwrap_or(true),
        })
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("models", &self.models.len())
            .field("fallback", &self.fallback)
            .field("has_executor", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Resilient request orchestration over many backends
///
/// Cheap to clone; clones share all state.
///
/// ```ignore
/// let orchestrator = Orchestrator::builder()
///     .executor(FnExecutor::new(|backend, request| async move {
///         Ok(ResponseEnvelope::new(backend, "hello"))
///     }))
///     .build()?;
///
/// let reply = orchestrator.chat(&RequestEnvelope::user("hi"), None).await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    queue: RequestQueue<OrchestraError>,
    fallback: FallbackConfig,
    queue_chats: bool,
}

impl Orchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Choose a backend without calling it
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Routing`] when nothing fits.
    pub fn route(
        &self,
        request: &RequestEnvelope,
        constraints: Option<&RoutingConstraints>,
    ) -> Result<RoutingDecision, OrchestraError> {
        let default = RoutingConstraints::default();
        match self
            .pipeline
            .router
            .route(request, constraints.unwrap_or(&default))
        {
            Ok(decision) => {
                self.pipeline.metrics.routed.inc();
                Ok(decision)
            }
            Err(e) => {
                self.pipeline.metrics.routing_failures.inc();
                tracing::warn!(request_id = %request.id, error = %e, "Routing failed");
                Err(e.into())
            }
        }
    }

    /// Call one backend through the breaker, limiter, and retry policy
    ///
    /// Bypasses the queue.
    ///
    /// # Errors
    ///
    /// [`OrchestraError::CircuitOpen`], [`OrchestraError::RateLimit`], or
    /// [`OrchestraError::Backend`].
    pub async fn execute(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, OrchestraError> {
        self.pipeline.execute(backend, request).await
    }

    /// Call one backend through the queue, then the rest of the pipeline
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Queue`] for admission failures, otherwise as
    /// [`execute`](Self::execute).
    pub async fn enqueue(
        &self,
        backend: BackendId,
        request: RequestEnvelope,
        options: EnqueueOptions,
    ) -> Result<ResponseEnvelope, OrchestraError> {
        let result = self
            .queue
            .enqueue(backend.clone(), request, options)
            .await
            .map_err(OrchestraError::from);
        if matches!(result, Err(OrchestraError::Queue(_))) {
            self.pipeline
                .metrics
                .record_rejection(&backend, Rejection::Queue);
        }
        result
    }

    async fn dispatch(
        &self,
        backend: BackendId,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, OrchestraError> {
        if self.queue_chats {
            self.enqueue(backend, request, EnqueueOptions::default()).await
        } else {
            self.pipeline.execute(&backend, &request).await
        }
    }

    fn attempt_fn(&self) -> AttemptFn<OrchestraError> {
        let this = self.clone();
        Arc::new(move |backend, request| {
            let this = this.clone();
            Box::pin(async move { this.dispatch(backend, request).await })
        })
    }

    /// Route, then call the selection, falling back through the alternatives
    ///
    /// Each backend gets one pipeline call; the retry policy already spends
    /// the per-backend retry budget inside it. With no alternatives the
    /// selection's own error is returned.
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Routing`] when nothing fits,
    /// [`OrchestraError::Fallback`] when every backend in the chain failed,
    /// or the selection's error when it had no alternatives.
    pub async fn chat(
        &self,
        request: &RequestEnvelope,
        constraints: Option<&RoutingConstraints>,
    ) -> Result<ChatResponse, OrchestraError> {
        let decision = self.route(request, constraints)?;

        if decision.alternatives.is_empty() {
            let response = self
                .dispatch(decision.backend.clone(), request.clone())
                .await?;
            return Ok(ChatResponse {
                response,
                attempted_backends: vec![decision.backend.clone()],
                decision,
                used_fallback: false,
                failures: Vec::new(),
            });
        }

        let chain = FallbackConfig::new(decision.chain())
            .with_max_retries(0)
            .with_retry_delay(Duration::ZERO);
        let manager = FallbackManager::new(chain, self.attempt_fn())?;

        match manager.chat(request).await {
            Ok(FallbackResponse {
                response,
                used_fallback,
                attempted_backends,
                failures,
            }) => {
                if used_fallback {
                    self.pipeline.metrics.fallbacks.inc();
                }
                Ok(ChatResponse {
                    response,
                    decision,
                    used_fallback,
                    attempted_backends,
                    failures,
                })
            }
            Err(e) => {
                self.pipeline.metrics.exhausted.inc();
                Err(e.into())
            }
        }
    }

    /// Fallback manager over the configured chain
    ///
    /// Attempts run through this orchestrator's pipeline.
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Fallback`] when no chain is configured.
    pub fn fallback(&self) -> Result<FallbackManager<OrchestraError>, OrchestraError> {
        let this = self.clone();
        let manager = FallbackManager::new(self.fallback.clone(), self.attempt_fn())?
            .on_fallback(move |_, _, _| this.pipeline.metrics.fallbacks.inc());
        Ok(manager)
    }

    /// Run `request` down the configured fallback chain
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Fallback`] when no chain is configured or every
    /// backend failed.
    pub async fn fallback_chat(
        &self,
        request: &RequestEnvelope,
    ) -> Result<FallbackResponse, OrchestraError> {
        let manager = self.fallback()?;
        manager.chat(request).await.map_err(|e| {
            self.pipeline.metrics.exhausted.inc();
            OrchestraError::from(e)
        })
    }

    // ========================================================================
    // Circuit Administration
    // ========================================================================

    /// Circuit state for a backend
    #[must_use]
    pub fn circuit_state(&self, backend: &BackendId) -> CircuitState {
        self.pipeline.breaker.state(backend)
    }

    /// Circuit statistics for a backend
    #[must_use]
    pub fn circuit_stats(&self, backend: &BackendId) -> CircuitStats {
        self.pipeline.breaker.stats(backend)
    }

    /// Circuit statistics for every backend seen
    #[must_use]
    pub fn all_circuit_stats(&self) -> Vec<CircuitStats> {
        self.pipeline.breaker.all_stats()
    }

    /// Close a backend's circuit and clear its history
    pub fn reset_circuit(&self, backend: &BackendId) {
        self.pipeline.breaker.reset(backend);
    }

    /// Reset every circuit
    pub fn reset_all_circuits(&self) {
        self.pipeline.breaker.reset_all();
    }

    /// Force a circuit into a state
    pub fn force_circuit_state(&self, backend: &BackendId, state: CircuitState) {
        self.pipeline.breaker.force_state(backend, state);
    }

    /// Change breaker thresholds at runtime
    pub fn configure_circuit_breaker(&self, patch: &CircuitBreakerConfigPatch) {
        self.pipeline.breaker.configure(patch);
    }

    /// Circuit transition events
    #[must_use]
    pub fn circuit_events(&self) -> BroadcastStream<CircuitEvent> {
        self.pipeline.breaker.events()
    }

    // ========================================================================
    // Router Administration
    // ========================================================================

    /// Install a routing rule
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Routing`] if the name is taken.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<(), OrchestraError> {
        Ok(self.pipeline.router.add_rule(rule)?)
    }

    /// Remove a routing rule
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Routing`] if no rule has that name.
    pub fn remove_rule(&self, name: &str) -> Result<RoutingRule, OrchestraError> {
        Ok(self.pipeline.router.remove_rule(name)?)
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.pipeline.router.rules()
    }

    /// Learned routing data as JSON
    #[must_use]
    pub fn export_learning_data(&self) -> serde_json::Value {
        self.pipeline.router.export_learning_data()
    }

    /// Merge learned routing data
    ///
    /// # Errors
    ///
    /// [`OrchestraError::Routing`] for malformed data.
    pub fn import_learning_data(&self, data: serde_json::Value) -> Result<usize, OrchestraError> {
        Ok(self.pipeline.router.import_learning_data(data)?)
    }

    /// Forget learned routing data
    pub fn reset_learning(&self) {
        self.pipeline.router.reset_learning();
    }

    /// Drop cached routing decisions
    pub fn clear_decision_cache(&self) {
        self.pipeline.router.clear_decision_cache();
    }

    /// Router counters
    #[must_use]
    pub fn router_stats(&self) -> RouterStats {
        self.pipeline.router.stats()
    }

    // ========================================================================
    // Limits & Components
    // ========================================================================

    /// Replace a backend's rate limits
    pub fn set_rate_limits(&self, backend: &BackendId, limits: RateLimits) {
        self.pipeline.limiter.set_limits(backend, limits);
    }

    /// Replace a backend's queue concurrency
    pub fn set_queue_concurrency(&self, backend: &BackendId, max: usize) {
        self.queue.set_max_concurrency(backend, max);
    }

    /// Queue statistics
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Model registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.pipeline.registry
    }

    /// Model router
    #[must_use]
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.pipeline.router
    }

    /// Rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.pipeline.limiter
    }

    /// Circuit breaker
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.pipeline.breaker
    }

    /// Metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let breaker = &self.pipeline.breaker;
        let mut snapshot = self
            .pipeline
            .metrics
            .snapshot(|backend| Some(breaker.state(backend)));
        snapshot.queue_pending = self.queue.pending();
        snapshot.queue_processing = self.queue.processing();
        snapshot
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executor", &self.pipeline.executor.name())
            .field("router", &self.pipeline.router)
            .field("queue", &self.queue)
            .field("fallback", &self.fallback)
            .field("queue_chats", &self.queue_chats)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, FnExecutor, OptimizationGoal, QuotaHint, TokenUsage};
    use crate::error::Subsystem;
    use crate::routing::RoutingStrategy;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    fn id(model: &str) -> BackendId {
        BackendId::new("test", model)
    }

    fn registry(models: &[(&str, f64)]) -> Arc<ModelRegistry> {
        let registry = ModelRegistry::new();
        for (name, price) in models {
            registry.register(ModelDefinition::new(id(name)).with_pricing(*price, *price));
        }
        Arc::new(registry)
    }

    fn no_retry() -> RetryConfig {
        RetryConfig::no_retry()
    }

    /// Executor whose listed backends fail with a server error
    fn executor(
        failing: &[&str],
        calls: Arc<Mutex<Vec<BackendId>>>,
    ) -> impl BackendExecutor + 'static {
        let failing: HashSet<BackendId> = failing.iter().map(|m| id(m)).collect();
        FnExecutor::new(move |backend: BackendId, _request: RequestEnvelope| {
            calls.lock().push(backend.clone());
            let fail = failing.contains(&backend);
            async move {
                if fail {
                    Err(BackendError::server("boom"))
                } else {
                    Ok(ResponseEnvelope::new(backend, "ok").with_usage(TokenUsage::new(1000, 500)))
                }
            }
        })
    }

    fn build(
        models: &[(&str, f64)],
        failing: &[&str],
    ) -> (Orchestrator, Arc<Mutex<Vec<BackendId>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::builder()
            .registry(registry(models))
            .retry(no_retry())
            .executor(executor(failing, Arc::clone(&calls)))
            .build()
            .unwrap();
        (orchestrator, calls)
    }

    #[test]
    fn test_build_requires_executor() {
        let err = Orchestrator::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[tokio::test]
    async fn test_execute_enriches_response() {
        let (orchestrator, _) = build(&[("a", 0.01)], &[]);

        let response = orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap();

        // 1000 in + 500 out at 0.01 per 1k each
        assert!((response.cost - 0.015).abs() < 1e-9);
        assert!(response.retry.is_none());

        let live = orchestrator.registry().metrics(&id("a")).unwrap();
        assert_eq!(live.total_requests, 1);
        assert_eq!(live.successful_requests, 1);

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.successes, 1);
        assert!((metrics.total_cost - 0.015).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_metadata_attached() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let orchestrator = Orchestrator::builder()
            .registry(registry(&[("a", 0.0)]))
            .retry(
                RetryConfig::default()
                    .with_base_delay(Duration::from_millis(10))
                    .with_jitter(false),
            )
            .executor(FnExecutor::new(move |backend: BackendId, _req: RequestEnvelope| {
                let n = {
                    let mut n = counter.lock();
                    *n += 1;
                    *n
                };
                async move {
                    if n < 3 {
                        Err(BackendError::timeout("slow"))
                    } else {
                        Ok(ResponseEnvelope::new(backend, "ok"))
                    }
                }
            }))
            .build()
            .unwrap();

        let response = orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap();
        let retry = response.retry.unwrap();
        assert_eq!(retry.attempts, 3);
        assert_eq!(*attempts.lock(), 3);
        assert_eq!(orchestrator.metrics().retries, 2);
        // One retry sequence is one breaker outcome
        assert_eq!(orchestrator.circuit_stats(&id("a")).total_requests, 1);
    }

    #[tokio::test]
    async fn test_circuit_open_rejects_without_calling() {
        let (orchestrator, calls) = build(&[("a", 0.0)], &[]);
        orchestrator.force_circuit_state(&id("a"), CircuitState::Open);

        let err = orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.subsystem(), Subsystem::CircuitBreaker);
        assert!(calls.lock().is_empty());
        assert_eq!(orchestrator.metrics().backends[0].circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_requests_count_only_executor_calls() {
        let (orchestrator, calls) = build(&[("a", 0.0), ("b", 0.0)], &["b"]);

        orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap();
        orchestrator
            .execute(&id("b"), &RequestEnvelope::user("hi"))
            .await
            .unwrap_err();
        orchestrator.force_circuit_state(&id("a"), CircuitState::Open);
        orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap_err();

        let metrics = orchestrator.metrics();
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.requests, metrics.successes + metrics.failures);
    }

    #[tokio::test]
    async fn test_quota_hint_updates_limiter() {
        let orchestrator = Orchestrator::builder()
            .registry(registry(&[("a", 0.0)]))
            .retry(no_retry())
            .executor(FnExecutor::new(|backend: BackendId, _req: RequestEnvelope| async move {
                Ok(ResponseEnvelope::new(backend, "ok").with_quota(
                    QuotaHint::new()
                        .with_remaining(0)
                        .with_reset_in(Duration::from_secs(30)),
                ))
            }))
            .build()
            .unwrap();

        orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap();
        assert!(!orchestrator.rate_limiter().can_proceed(&id("a")).is_allowed());
    }

    #[tokio::test]
    async fn test_chat_falls_back_to_alternative() {
        let (orchestrator, calls) = build(&[("a", 0.001), ("b", 0.002)], &["a"]);

        let request = RequestEnvelope::user("hi").with_optimize(OptimizationGoal::Cost);
        let reply = orchestrator.chat(&request, None).await.unwrap();

        assert_eq!(reply.decision.backend, id("a"));
        assert_eq!(reply.decision.strategy, RoutingStrategy::CostOptimized);
        assert_eq!(reply.response.backend, id("b"));
        assert!(reply.used_fallback);
        assert_eq!(reply.attempted_backends, vec![id("a"), id("b")]);
        assert_eq!(reply.failures.len(), 1);
        assert_eq!(*calls.lock(), vec![id("a"), id("b")]);
        assert_eq!(orchestrator.metrics().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_chat_all_fail() {
        let (orchestrator, _) = build(&[("a", 0.001), ("b", 0.002)], &["a", "b"]);

        let err = orchestrator
            .chat(&RequestEnvelope::user("hi"), None)
            .await
            .unwrap_err();
        assert_eq!(err.subsystem(), Subsystem::Fallback);
        assert!(err.to_string().contains("test/a"));
        assert!(err.to_string().contains("test/b"));
        assert_eq!(orchestrator.metrics().exhausted, 1);
    }

    #[tokio::test]
    async fn test_chat_single_candidate_returns_own_error() {
        let (orchestrator, _) = build(&[("a", 0.001)], &["a"]);

        let err = orchestrator
            .chat(&RequestEnvelope::user("hi"), None)
            .await
            .unwrap_err();
        assert_eq!(err.subsystem(), Subsystem::Backend);
    }

    #[tokio::test]
    async fn test_chat_no_candidates() {
        let (orchestrator, _) = build(&[("a", 0.05)], &[]);

        let err = orchestrator
            .chat(
                &RequestEnvelope::user("hi"),
                Some(&RoutingConstraints::new().with_max_cost(0.000_001)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.subsystem(), Subsystem::Router);
        assert_eq!(orchestrator.metrics().routing_failures, 1);
    }

    #[tokio::test]
    async fn test_fallback_chat_uses_configured_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::builder()
            .registry(registry(&[("a", 0.0), ("b", 0.0)]))
            .retry(no_retry())
            .fallback(
                FallbackConfig::new(vec![id("a"), id("b")])
                    .with_max_retries(0)
                    .with_retry_delay(Duration::ZERO),
            )
            .executor(executor(&["a"], Arc::clone(&calls)))
            .build()
            .unwrap();

        let reply = orchestrator
            .fallback_chat(&RequestEnvelope::user("hi"))
            .await
            .unwrap();
        assert!(reply.used_fallback);
        assert_eq!(reply.response.backend, id("b"));
    }

    #[tokio::test]
    async fn test_fallback_without_chain() {
        let (orchestrator, _) = build(&[("a", 0.0)], &[]);
        let err = orchestrator.fallback().unwrap_err();
        assert_eq!(err.subsystem(), Subsystem::Fallback);
    }

    #[tokio::test]
    async fn test_enqueue_runs_pipeline() {
        let (orchestrator, calls) = build(&[("a", 0.0)], &[]);

        let response = orchestrator
            .enqueue(id("a"), RequestEnvelope::user("hi"), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(orchestrator.queue_stats().completed, 1);
    }

    #[tokio::test]
    async fn test_adaptive_learning_fed_by_completions() {
        let (orchestrator, _) = build(&[("a", 0.0)], &[]);
        let request = RequestEnvelope::user("hi");
        orchestrator.execute(&id("a"), &request).await.unwrap();

        assert_eq!(orchestrator.router_stats().learned_pairs, 1);
        orchestrator.reset_learning();
        assert_eq!(orchestrator.router_stats().learned_pairs, 0);
    }

    #[tokio::test]
    async fn test_prometheus_snapshot() {
        let (orchestrator, _) = build(&[("a", 0.0)], &[]);
        orchestrator
            .execute(&id("a"), &RequestEnvelope::user("hi"))
            .await
            .unwrap();

        let text = orchestrator.metrics().to_prometheus();
        assert!(text.contains("orchestra_backend_requests_total{backend=\"test/a\"} 1"));
        assert!(text.contains("orchestra_circuit_state{backend=\"test/a\"} 0"));
    }
}
