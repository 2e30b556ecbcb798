//! Backend boundary
//!
//! Types shared between the orchestration layer and the pluggable executor
//! that performs the real provider call.
//!
//! # Usage
//!
//! ```ignore
//! use orchestra_core::backend::{BackendId, FnExecutor, RequestEnvelope, ResponseEnvelope};
//!
//! let executor = FnExecutor::new(|backend: BackendId, request: RequestEnvelope| async move {
//!     let reply = call_provider(&backend, &request).await?;
//!     Ok(ResponseEnvelope::new(backend, reply))
//! });
//! ```

mod envelope;
mod error;
mod identity;
mod quota;
mod traits;

pub use envelope::{
    ChatMessage, FeatureSet, OptimizationGoal, Priority, RequestEnvelope, ResponseEnvelope, Role,
    TokenUsage, DEFAULT_EXPECTED_OUTPUT_TOKENS,
};
pub use error::{BackendError, ErrorKind};
pub use identity::{BackendId, ParseBackendIdError};
pub use quota::{QuotaHint, MAX_HINT_DELAY};
pub use traits::{BackendExecutor, FnExecutor};
