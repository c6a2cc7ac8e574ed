//! Core agent types.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_weight() -> f64 {
    1.0
}

/// A role bound to a remote provider.
///
/// Agents are configuration: loaded once, shared read-only across every task.
///
/// # Invariants
/// - `weight > 0.0` (enforced by config validation)
/// - Lower `priority` wins ties during aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Role name, unique within a team
    pub role: String,

    /// Provider ("virtual key") this agent calls through
    pub provider_id: String,

    /// Capabilities this agent offers
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,

    /// Tie-break rank; lowest value wins
    #[serde(default)]
    pub priority: u32,

    /// Confidence weight for weighted aggregation
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Per-call timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Model override passed to the provider client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Agent {
    /// Create an agent with no capabilities, priority 0 and weight 1.0.
    pub fn new(role: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            provider_id: provider_id.into(),
            capability_tags: BTreeSet::new(),
            priority: 0,
            weight: default_weight(),
            timeout_ms: None,
            model: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check that this agent offers every required capability.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capability_tags)
    }

    /// Per-call timeout, if overridden.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Presentation style applied to prompts for a team.
///
/// Only shapes the outgoing prompt; aggregation never looks at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    #[default]
    Neutral,
    Business,
    Technical,
}

impl ResponseStyle {
    /// Instruction prepended to prompts, if any.
    pub fn instruction(&self) -> Option<&'static str> {
        match self {
            Self::Neutral => None,
            Self::Business => Some(
                "Answer for a business audience: lead with the decision and its impact, avoid jargon.",
            ),
            Self::Technical => Some(
                "Answer for an engineering audience: be precise, include the relevant technical detail.",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matching() {
        let agent = Agent::new("analyst", "openai")
            .with_capability("code")
            .with_capability("security");

        let mut required = BTreeSet::new();
        assert!(agent.has_capabilities(&required));

        required.insert("code".to_string());
        assert!(agent.has_capabilities(&required));

        required.insert("legal".to_string());
        assert!(!agent.has_capabilities(&required));
    }

    #[test]
    fn test_deserialize_defaults() {
        let agent: Agent =
            serde_yaml::from_str("role: reviewer\nprovider_id: anthropic\n").unwrap();
        assert_eq!(agent.priority, 0);
        assert_eq!(agent.weight, 1.0);
        assert!(agent.capability_tags.is_empty());
        assert_eq!(agent.timeout(), None);
    }
}
