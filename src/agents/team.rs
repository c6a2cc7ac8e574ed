//! Teams: named, ordered sets of agents plus their strategy settings.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Agent, ResponseStyle};
use crate::aggregate::{Algorithm, Quorum};
use crate::strategy::StrategyKind;

fn default_true() -> bool {
    true
}

fn default_severity_threshold() -> f64 {
    0.7
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_max_rounds() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    0.7
}

/// Named tiers used by tiered escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Rapid,
    Deep,
    Validation,
    Exhaustive,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Rapid => "rapid",
            Tier::Deep => "deep",
            Tier::Validation => "validation",
            Tier::Exhaustive => "exhaustive",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier membership (by role) and escalation thresholds.
///
/// Empty `rapid` means "the single lowest-priority agent"; empty `deep`
/// means "every agent not in the rapid tier". Validation and exhaustive
/// tiers only exist when listed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default)]
    pub rapid: Vec<String>,
    #[serde(default)]
    pub deep: Vec<String>,
    #[serde(default)]
    pub validation: Vec<String>,
    #[serde(default)]
    pub exhaustive: Vec<String>,
    /// Escalate when any contribution reports severity at or above this
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: f64,
    /// Escalate when tier agreement falls below this
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            rapid: Vec::new(),
            deep: Vec::new(),
            validation: Vec::new(),
            exhaustive: Vec::new(),
            severity_threshold: default_severity_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

/// Quality gate roles. Unset roles fall back to the first and second agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default = "default_quality_threshold")]
    pub threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            primary: None,
            reviewer: None,
            threshold: default_quality_threshold(),
        }
    }
}

/// A named team of agents.
///
/// # Invariants
/// - Role names are unique within the team
/// - Every role referenced by tiers or the quality gate exists in `agents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub quorum: Quorum,
    /// Allow swapping in an unused agent when a provider's circuit is open
    #[serde(default = "default_true")]
    pub allow_substitution: bool,
    #[serde(default)]
    pub style: ResponseStyle,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub debate: DebateConfig,
    #[serde(default)]
    pub quality: QualityConfig,
}

impl Team {
    /// Create a parallel-consensus team with default settings.
    pub fn new(name: impl Into<String>, agents: Vec<Agent>) -> Self {
        Self {
            name: name.into(),
            agents,
            strategy: StrategyKind::default(),
            algorithm: Algorithm::default(),
            quorum: Quorum::default(),
            allow_substitution: true,
            style: ResponseStyle::default(),
            tiers: TierConfig::default(),
            debate: DebateConfig::default(),
            quality: QualityConfig::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn agent(&self, role: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.role == role)
    }

    /// Agents offering every required capability, ordered by `(priority, role)`.
    pub fn eligible(&self, required: &BTreeSet<String>) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self
            .agents
            .iter()
            .filter(|a| a.has_capabilities(required))
            .collect();
        agents.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.role.cmp(&b.role)));
        agents
    }

    /// Members of a tier, restricted to `eligible` and kept in its order.
    pub fn tier_members<'a>(&self, tier: Tier, eligible: &[&'a Agent]) -> Vec<&'a Agent> {
        let roles = match tier {
            Tier::Rapid => &self.tiers.rapid,
            Tier::Deep => &self.tiers.deep,
            Tier::Validation => &self.tiers.validation,
            Tier::Exhaustive => &self.tiers.exhaustive,
        };

        if roles.is_empty() {
            return match tier {
                Tier::Rapid => eligible.iter().take(1).copied().collect(),
                Tier::Deep => {
                    let rapid: HashSet<&str> = self
                        .tier_members(Tier::Rapid, eligible)
                        .iter()
                        .map(|a| a.role.as_str())
                        .collect();
                    eligible
                        .iter()
                        .filter(|a| !rapid.contains(a.role.as_str()))
                        .copied()
                        .collect()
                }
                Tier::Validation | Tier::Exhaustive => Vec::new(),
            };
        }

        eligible
            .iter()
            .filter(|a| roles.iter().any(|r| r == &a.role))
            .copied()
            .collect()
    }

    /// Validate internal references and that every provider is known.
    pub fn validate(&self, known_providers: &HashSet<String>) -> Result<(), String> {
        if self.agents.is_empty() {
            return Err(format!("team '{}' has no agents", self.name));
        }

        let mut roles = HashSet::new();
        for agent in &self.agents {
            if !roles.insert(agent.role.as_str()) {
                return Err(format!(
                    "team '{}' has duplicate role '{}'",
                    self.name, agent.role
                ));
            }
            if !known_providers.contains(&agent.provider_id) {
                return Err(format!(
                    "agent '{}' in team '{}' references unknown provider '{}'",
                    agent.role, self.name, agent.provider_id
                ));
            }
            if !(agent.weight > 0.0) {
                return Err(format!(
                    "agent '{}' in team '{}' must have a positive weight",
                    agent.role, self.name
                ));
            }
        }

        let referenced = self
            .tiers
            .rapid
            .iter()
            .chain(&self.tiers.deep)
            .chain(&self.tiers.validation)
            .chain(&self.tiers.exhaustive)
            .chain(self.quality.primary.iter())
            .chain(self.quality.reviewer.iter());
        for role in referenced {
            if !roles.contains(role.as_str()) {
                return Err(format!(
                    "team '{}' references unknown role '{}'",
                    self.name, role
                ));
            }
        }

        Ok(())
    }
}

/// Read-only lookup of teams by name.
#[derive(Debug, Default, Clone)]
pub struct TeamRegistry {
    teams: HashMap<String, Arc<Team>>,
}

impl TeamRegistry {
    pub fn new(teams: impl IntoIterator<Item = Team>) -> Self {
        Self {
            teams: teams
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Team>> {
        self.teams.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.teams.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}
