//! The unified result returned for every task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TaskId;
use crate::agents::Tier;
use crate::error::InvocationError;
use crate::health::DegradationLevel;
use crate::strategy::StrategyKind;

/// Outcome class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// A quorum of agents agreed
    Success,
    /// An answer exists but is incomplete (quorum missed, deadline hit, gate undecided)
    Partial,
    /// No usable answer
    Failure,
}

/// Why a task produced no usable answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every dispatched agent failed
    AggregationFailure,
    /// No team agent offers the required capabilities
    NoCapableAgent,
    UnknownTeam { team: String },
    /// The deadline passed before any agent answered
    TaskTimeout,
    /// The caller cancelled before any agent answered
    Cancelled,
    /// The swarm refused new work at this degradation level
    Rejected { level: DegradationLevel },
    /// The task's worker stopped without producing a result
    Aborted,
}

/// A successful agent output kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub role: String,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<f64>,
    pub latency_ms: u64,
    pub token_cost: u64,
    pub attempts: u32,
}

/// A failed agent call kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentFailure {
    pub role: String,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    pub error: InvocationError,
    pub latency_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }
}

/// Final output of a task.
///
/// # Invariants
/// - `status == Failure` iff `payload.is_none()`
/// - `failure_reason.is_some()` iff `status == Failure`
/// - `contributions` holds successes only; errors live in `failures`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Agreement in `[0.0, 1.0]`
    pub confidence: f64,
    /// Strategy that actually ran
    pub strategy: StrategyKind,
    /// Strategy that was requested, when degradation replaced it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_from: Option<StrategyKind>,
    /// Degradation level observed at dispatch
    pub level: DegradationLevel,
    pub contributions: Vec<Contribution>,
    pub failures: Vec<AgentFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Tiers run, in order (tiered escalation only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalation_path: Vec<Tier>,
    pub timing: Timing,
}

impl SwarmResult {
    /// A failure with no contributions.
    pub fn failure(task_id: TaskId, strategy: StrategyKind, reason: FailureReason) -> Self {
        Self {
            task_id,
            status: ResultStatus::Failure,
            payload: None,
            confidence: 0.0,
            strategy,
            degraded_from: None,
            level: DegradationLevel::Normal,
            contributions: Vec::new(),
            failures: Vec::new(),
            failure_reason: Some(reason),
            escalation_path: Vec::new(),
            timing: Timing::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ResultStatus::Failure
    }

    /// Highest severity reported by any contribution.
    pub fn max_severity(&self) -> Option<f64> {
        self.contributions
            .iter()
            .filter_map(|c| c.severity)
            .fold(None, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))))
    }

    /// Label every unlabelled contribution and failure with `tier`.
    pub fn label_tier(mut self, tier: Tier) -> Self {
        for c in &mut self.contributions {
            c.tier.get_or_insert(tier);
        }
        for f in &mut self.failures {
            f.tier.get_or_insert(tier);
        }
        self
    }

    /// Append another result's audit trail (contributions, failures) to this one.
    pub fn merge_audit(&mut self, other: SwarmResult) {
        let mut contributions = other.contributions;
        contributions.append(&mut self.contributions);
        self.contributions = contributions;

        let mut failures = other.failures;
        failures.append(&mut self.failures);
        self.failures = failures;
    }

    /// Downgrade a success to partial; partial and failure are unchanged.
    pub fn downgrade(&mut self) {
        if self.status == ResultStatus::Success {
            self.status = ResultStatus::Partial;
        }
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        self.timing = Timing {
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        self
    }
}
