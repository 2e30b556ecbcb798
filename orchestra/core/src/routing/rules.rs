//! Routing rules
//!
//! Operator-defined overrides evaluated before adaptive learning and the
//! default strategy. Rules are kept sorted by descending priority; the first
//! enabled rule whose condition matches wins.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, OptimizationGoal, Priority, RequestEnvelope};
use crate::registry::RoutingConstraints;

use super::strategy::RoutingStrategy;

/// Request predicate; every set field must match
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    /// Request task type equals this (case-insensitive)
    pub task_type: Option<String>,
    /// Tools flag equals this
    pub uses_tools: Option<bool>,
    /// Image presence equals this
    pub has_images: Option<bool>,
    /// Priority tier equals this
    pub priority: Option<Priority>,
    /// Optimisation goal equals this
    pub optimize: Option<OptimizationGoal>,
    /// User id is one of these (empty = any)
    pub user_ids: Vec<String>,
    /// At least this many messages
    pub min_messages: Option<usize>,
    /// At least this many characters in total
    pub min_total_chars: Option<usize>,
    /// At most this many characters in total
    pub max_total_chars: Option<usize>,
}

impl RuleCondition {
    /// Condition that matches every request
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Match a task type
    #[must_use]
    pub fn task_type(task_type: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            ..Self::default()
        }
    }

    /// Whether `request` satisfies every set field
    #[must_use]
    pub fn matches(&self, request: &RequestEnvelope) -> bool {
        if let Some(task) = &self.task_type {
            match &request.task_type {
                Some(t) if t.eq_ignore_ascii_case(task) => {}
                _ => return false,
            }
        }
        if self.uses_tools.is_some_and(|v| v != request.uses_tools) {
            return false;
        }
        if self.has_images.is_some_and(|v| v != request.has_images()) {
            return false;
        }
        if self.priority.is_some() && self.priority != request.priority {
            return false;
        }
        if self.optimize.is_some() && self.optimize != request.optimize {
            return false;
        }
        if !self.user_ids.is_empty() {
            match &request.user_id {
                Some(user) if self.user_ids.iter().any(|u| u == user) => {}
                _ => return false,
            }
        }
        let chars = request.total_chars();
        self.min_messages.map_or(true, |min| request.messages.len() >= min)
            && self.min_total_chars.map_or(true, |min| chars >= min)
            && self.max_total_chars.map_or(true, |max| chars <= max)
    }
}

/// What a matching rule does
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// Send to this backend
    Backend(BackendId),
    /// Rank with this strategy under extra constraints
    Strategy {
        /// Strategy to apply
        strategy: RoutingStrategy,
        /// Constraints layered over the caller's
        #[serde(default)]
        constraints: Option<RoutingConstraints>,
    },
}

/// A named routing override
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Unique name
    pub name: String,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are skipped
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// When the rule applies
    #[serde(default)]
    pub condition: RuleCondition,
    /// What it does
    pub target: RuleTarget,
}

fn enabled_default() -> bool {
    true
}

impl RoutingRule {
    /// Rule that sends matching requests to one backend
    pub fn to_backend(name: impl Into<String>, condition: RuleCondition, backend: BackendId) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            condition,
            target: RuleTarget::Backend(backend),
        }
    }

    /// Rule that switches strategy for matching requests
    pub fn to_strategy(
        name: impl Into<String>,
        condition: RuleCondition,
        strategy: RoutingStrategy,
        constraints: Option<RoutingConstraints>,
    ) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            condition,
            target: RuleTarget::Strategy {
                strategy,
                constraints,
            },
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Ordered rule list
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    /// Insert behind every rule of equal or higher priority; false if the name is taken
    pub fn add(&mut self, rule: RoutingRule) -> bool {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return false;
        }
        let pos = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(pos, rule);
        true
    }

    /// Remove by name
    pub fn remove(&mut self, name: &str) -> Option<RoutingRule> {
        let pos = self.rules.iter().position(|r| r.name == name)?;
        Some(self.rules.remove(pos))
    }

    /// First enabled rule matching `request`
    #[must_use]
    pub fn first_match(&self, request: &RequestEnvelope) -> Option<&RoutingRule> {
        self.rules
            .iter()
            .find(|r| r.enabled && r.condition.matches(request))
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }
}

// ============================================================================
// Tests
// ============================================================================
