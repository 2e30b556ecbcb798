//! Orchestra Core - Resilient Request Orchestration for LLM Backends
//!
//! This crate decides which model backend should serve a request and keeps
//! calls flowing when backends are slow, rate limited, or down. It does not
//! talk to any provider itself: callers plug in a [`BackendExecutor`] and the
//! orchestrator wraps it with routing, admission control, and failure
//! handling.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                            │
//! │                                                                  │
//! │  ┌───────────────┐   ┌─────────────────────────────────────────┐ │
//! │  │ Model Router  │   │            Fallback Manager             │ │
//! │  │ rules         │   │  [selected, alternative, alternative..] │ │
//! │  │ adaptive      │──>│                    │                    │ │
//! │  │ strategies    │   └────────────────────┼────────────────────┘ │
//! │  │ load balancer │                        ▼                      │
//! │  │ decision cache│   ┌─────────┐  ┌─────────┐  ┌─────┐  ┌──────┐ │
//! │  └───────┬───────┘   │  Queue  │─>│ Circuit │─>│Rate │─>│Retry │ │
//! │          │           │         │  │ Breaker │  │Limit│  │      │ │
//! │  ┌───────┴───────┐   └─────────┘  └─────────┘  └─────┘  └──┬───┘ │
//! │  │Model Registry │<── cost, latency, outcomes ─────────────┤     │
//! │  └───────────────┘                                         │     │
//! └────────────────────────────────────────────────────────────┼─────┘
//!                                                              ▼
//!                                                   BackendExecutor (I/O)
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: Composes every component around one executor
//! - [`ModelRegistry`]: Model catalog with pricing and live metrics
//! - [`ModelRouter`]: Picks a backend and ranked alternatives
//! - [`CircuitBreaker`], [`RateLimiter`], [`RetryPolicy`], [`RequestQueue`],
//!   [`FallbackManager`]: Resilience primitives, usable on their own
//!
//! # Quick Start
//!
//! ```ignore
//! use orchestra_core::{
//!     backend::{FnExecutor, RequestEnvelope, ResponseEnvelope},
//!     Orchestrator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = orchestra_core::load_config()?;
//!     orchestra_core::logging::init_logging(&config.log_filter)?;
//!
//!     let orchestrator = orchestra_core::OrchestratorBuilder::from_config(&config)
//!         .executor(FnExecutor::new(|backend, _request| async move {
//!             Ok(ResponseEnvelope::new(backend, "hello"))
//!         }))
//!         .build()?;
//!
//!     let reply = orchestrator
//!         .chat(&RequestEnvelope::user("Summarize this"), None)
//!         .await?;
//!     println!("{} answered: {}", reply.response.backend, reply.response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Backend identity, request/response envelopes, executor trait
//! - [`registry`]: Model definitions, pricing, constraints, live metrics
//! - [`resilience`]: Circuit breaker, retry, rate limiter, queue, fallback
//! - [`routing`]: Strategies, load balancer, adaptive learning, rules, cache
//! - [`orchestrator`]: The composed pipeline
//! - [`metrics`]: Counters, histograms, Prometheus text export
//! - [`config`]: TOML and environment configuration
//! - [`error`]: Orchestrator error type
//! - [`logging`]: Optional `tracing` subscriber setup

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod routing;

// Backend exports
pub use backend::{
    BackendError, BackendExecutor, BackendId, ErrorKind, FnExecutor, QuotaHint, RequestEnvelope,
    ResponseEnvelope,
};

// Orchestrator exports
pub use error::{OrchestraError, Subsystem};
pub use orchestrator::{ChatResponse, Orchestrator, OrchestratorBuilder};

// Registry exports
pub use registry::{ModelDefinition, ModelRegistry, QualityTier, RoutingConstraints};

// Resilience exports
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackConfig, FallbackManager,
    QueueConfig, RateLimiter, RateLimiterConfig, RateLimits, RequestQueue, RetryConfig,
    RetryPolicy,
};

// Routing exports
pub use routing::{ModelRouter, RouterConfig, RoutingDecision, RoutingRule, RoutingStrategy};

// Metrics exports
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, OrchestraConfig, OrchestraToml,
};
