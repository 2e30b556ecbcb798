//! Request and response envelopes
//!
//! The envelope types are the only data that crosses the executor boundary.
//! Requests carry routing hints alongside the chat messages; responses carry
//! usage and are enriched by the orchestrator with cost, latency, and retry
//! metadata before they reach the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::BackendId;
use super::quota::QuotaHint;
use crate::resilience::retry::RetryMetadata;

/// Output tokens assumed for cost estimates when a request sets no limit
pub const DEFAULT_EXPECTED_OUTPUT_TOKENS: u32 = 1000;

// ============================================================================
// Routing hints
// ============================================================================

/// Priority tier of a request
///
/// Ordering is by urgency: `High < Normal < Low`, so sorting ascending puts
/// the most urgent work first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Served before everything else
    High,
    /// Default tier
    #[default]
    Normal,
    /// Served when nothing more urgent is waiting
    Low,
}

/// What the caller wants the router to optimise for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    /// Cheapest backend
    Cost,
    /// Highest quality tier
    Quality,
    /// Lowest observed latency
    Latency,
    /// Weighted blend of all factors
    Balanced,
}

/// Optional backend features a request may require
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSet {
    /// Image input
    pub vision: bool,
    /// Tool / function calling
    pub function_calling: bool,
    /// Structured JSON output
    pub json_mode: bool,
    /// Token streaming
    pub streaming: bool,
}

impl FeatureSet {
    /// True when every feature set in `required` is also set in `self`
    #[must_use]
    pub fn satisfies(&self, required: &FeatureSet) -> bool {
        (!required.vision || self.vision)
            && (!required.function_calling || self.function_calling)
            && (!required.json_mode || self.json_mode)
            && (!required.streaming || self.streaming)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Author of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// End user
    User,
    /// Model output
    Assistant,
    /// Tool result
    Tool,
}

/// A single chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message author
    pub role: Role,
    /// Text content
    pub content: String,
    /// Whether the message carries image attachments
    #[serde(default)]
    pub has_image: bool,
}

impl ChatMessage {
    /// Create a message with the given role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            has_image: false,
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Mark the message as carrying an image
    #[must_use]
    pub fn with_image(mut self) -> Self {
        self.has_image = true;
        self
    }
}

// ============================================================================
// Request
// ============================================================================

/// A chat request plus the hints the orchestration layer acts on
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request id
    pub id: Uuid,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Whether tool definitions are attached
    #[serde(default)]
    pub uses_tools: bool,
    /// Output token limit
    pub max_tokens: Option<u32>,
    /// Queue priority; the queue default applies when unset
    pub priority: Option<Priority>,
    /// Per-request deadline, overriding the queue default
    #[serde(default, with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Optimisation goal for routing
    pub optimize: Option<OptimizationGoal>,
    /// User id used for sticky sessions
    pub user_id: Option<String>,
    /// Task type (e.g. `code`, `reasoning`) for capability routing
    pub task_type: Option<String>,
    /// Features the chosen backend must support
    #[serde(default)]
    pub required_features: FeatureSet,
}

impl RequestEnvelope {
    /// Create a request from a list of messages
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
            uses_tools: false,
            max_tokens: None,
            priority: None,
            timeout: None,
            optimize: None,
            user_id: None,
            task_type: None,
            required_features: FeatureSet::default(),
        }
    }

    /// Create a single-turn user request
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(content)])
    }

    /// Set the priority tier
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set a per-request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the optimisation goal
    #[must_use]
    pub fn with_optimize(mut self, goal: OptimizationGoal) -> Self {
        self.optimize = Some(goal);
        self
    }

    /// Set the user id for sticky sessions
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the task type
    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Set the output token limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Mark the request as carrying tool definitions
    #[must_use]
    pub fn with_tools(mut self) -> Self {
        self.uses_tools = true;
        self.required_features.function_calling = true;
        self
    }

    /// Require a set of backend features
    #[must_use]
    pub fn with_required_features(mut self, features: FeatureSet) -> Self {
        self.required_features = features;
        self
    }

    /// Whether any message carries an image
    #[must_use]
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| m.has_image)
    }

    /// Total characters across all messages
    #[must_use]
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    /// Mean message length in characters
    #[must_use]
    pub fn average_message_len(&self) -> usize {
        if self.messages.is_empty() {
            0
        } else {
            self.total_chars() / self.messages.len()
        }
    }

    /// Rough input token estimate (four characters per token)
    #[must_use]
    pub fn estimated_input_tokens(&self) -> u32 {
        u32::try_from(self.total_chars().div_ceil(4)).unwrap_or(u32::MAX)
    }

    /// Output tokens used for cost estimates
    #[must_use]
    pub fn expected_output_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_EXPECTED_OUTPUT_TOKENS)
    }

    /// Features the request needs, including those implied by its content
    #[must_use]
    pub fn effective_features(&self) -> FeatureSet {
        let mut features = self.required_features;
        features.vision |= self.has_images();
        features.function_calling |= self.uses_tools;
        features
    }
}

// ============================================================================
// Response
// ============================================================================

/// Token usage reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Completion tokens
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Create a usage record
    #[must_use]
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Sum of input and output tokens
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A backend response, enriched on its way back to the caller
#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    /// Backend that produced the response
    pub backend: BackendId,
    /// Generated text
    pub content: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Cost in USD, filled in by the orchestrator
    pub cost: f64,
    /// Wall-clock latency, filled in by the orchestrator
    pub latency: Duration,
    /// Optional quality score in `[0, 1]` supplied by the executor
    pub quality: Option<f64>,
    /// Provider quota information observed on this call
    pub quota: Option<QuotaHint>,
    /// Present only when at least one retry happened
    pub retry: Option<RetryMetadata>,
}

impl ResponseEnvelope {
    /// Create a response with content and no usage
    pub fn new(backend: BackendId, content: impl Into<String>) -> Self {
        Self {
            backend,
            content: content.into(),
            usage: TokenUsage::default(),
            cost: 0.0,
            latency: Duration::ZERO,
            quality: None,
            quota: None,
            retry: None,
        }
    }

    /// Attach token usage
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Attach a quality score
    #[must_use]
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality.clamp(0.0, 1.0));
        self
    }

    /// Attach a quota hint
    #[must_use]
    pub fn with_quota(mut self, quota: QuotaHint) -> Self {
        self.quota = Some(quota);
        self
    }
}

mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
