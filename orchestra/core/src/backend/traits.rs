//! Backend executor trait
//!
//! The executor is the only part of a call chain that performs real I/O.
//! The orchestration layer wraps it with admission control, rate limiting,
//! circuit breaking, and retries, but never looks inside it.
//!
//! Implementations talk to a provider (HTTP, SDK, local model), map the
//! provider's answer into a [`ResponseEnvelope`], and report failures as
//! [`BackendError`]s, attaching a [`QuotaHint`](super::QuotaHint) when the
//! provider sent rate-limit headers.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::envelope::{RequestEnvelope, ResponseEnvelope};
use super::error::BackendError;
use super::identity::BackendId;

/// Performs a single call against one backend
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Send `request` to `backend` and return its response
    async fn execute(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, BackendError>;

    /// Executor name used in logs
    fn name(&self) -> &str {
        "executor"
    }
}

/// Adapts an async closure into a [`BackendExecutor`]
///
/// ```ignore
/// let executor = FnExecutor::new(|backend, request| async move {
///     Ok(ResponseEnvelope::new(backend, "hello"))
/// });
/// ```
pub struct FnExecutor<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnExecutor<F, Fut>
where
    F: Fn(BackendId, RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseEnvelope, BackendError>> + Send,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> BackendExecutor for FnExecutor<F, Fut>
where
    F: Fn(BackendId, RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseEnvelope, BackendError>> + Send,
{
    async fn execute(
        &self,
        backend: &BackendId,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, BackendError> {
        (self.f)(backend.clone(), request.clone()).await
    }

    fn name(&self) -> &str {
        "fn-executor"
    }
}
