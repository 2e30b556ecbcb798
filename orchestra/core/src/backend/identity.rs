//! Backend identity
//!
//! A backend is one `(provider, model)` endpoint. Every per-backend table in
//! the crate (circuits, rate windows, queue slots, metrics) is keyed by
//! [`BackendId`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identity of one interchangeable backend service
///
/// Cheap to clone: both halves are reference counted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendId {
    provider: Arc<str>,
    model: Arc<str>,
}

impl BackendId {
    /// Create a backend identity from provider and model names
    pub fn new(provider: impl AsRef<str>, model: impl AsRef<str>) -> Self {
        Self {
            provider: Arc::from(provider.as_ref()),
            model: Arc::from(model.as_ref()),
        }
    }

    /// Provider name (e.g. `openai`)
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model name (e.g. `gpt-4o-mini`)
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Error returned when a `provider/model` string cannot be parsed
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid backend id '{0}': expected 'provider/model'")]
pub struct ParseBackendIdError(pub String);

impl FromStr for BackendId {
    type Err = ParseBackendIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider.trim(), model.trim()))
            }
            _ => Err(ParseBackendIdError(s.to_string())),
        }
    }
}

impl TryFrom<String> for BackendId {
    type Error = ParseBackendIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendId> for String {
    fn from(id: BackendId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = BackendId::new("anthropic", "claude-3-haiku");
        assert_eq!(id.to_string(), "anthropic/claude-3-haiku");

        let parsed: BackendId = "anthropic/claude-3-haiku".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.provider(), "anthropic");
        assert_eq!(parsed.model(), "claude-3-haiku");
    }

    #[test]
    fn test_model_may_contain_slash() {
        let parsed: BackendId = "together/meta-llama/Llama-3-8b".parse().unwrap();
        assert_eq!(parsed.provider(), "together");
        assert_eq!(parsed.model(), "meta-llama/Llama-3-8b");
    }

    #[test]
    fn test_parse_rejects_missing_half() {
        assert!("openai".parse::<BackendId>().is_err());
        assert!("/gpt-4".parse::<BackendId>().is_err());
        assert!("openai/".parse::<BackendId>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = BackendId::new("openai", "gpt-4o");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"openai/gpt-4o\"");
        let back: BackendId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
