//! Result aggregation: turn many agent outputs into one decision.
//!
//! - **Majority**: group equivalent outputs, the largest group wins
//! - **Weighted**: group equivalent outputs, the highest summed weight wins
//! - **Final**: the last successful output in input order (debate, quality gate)
//!
//! Majority and weighted sort results by `(priority, role)` before grouping,
//! so the decision never depends on completion order. Ties go to the group
//! holding the lowest priority value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::health::DegradationLevel;
use crate::invoker::InvocationResult;
use crate::strategy::StrategyKind;
use crate::task::{AgentFailure, Contribution, FailureReason, ResultStatus, SwarmResult, TaskId, Timing};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Majority,
    Weighted,
    Final,
}

/// How many successes a dispatch needs to count as a full success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    /// More than half of the dispatched agents
    #[default]
    Majority,
    /// At least this many (capped at the number dispatched)
    AtLeast(usize),
    /// Every dispatched agent
    All,
}

impl Quorum {
    pub fn required(&self, dispatched: usize) -> usize {
        match self {
            Quorum::Majority => dispatched / 2 + 1,
            Quorum::AtLeast(n) => (*n).clamp(1, dispatched.max(1)),
            Quorum::All => dispatched.max(1),
        }
    }
}

/// Decides whether two outputs say the same thing.
pub type Equivalence = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Exact match after trimming whitespace.
pub fn trimmed_equality() -> Equivalence {
    Arc::new(|a: &str, b: &str| a.trim() == b.trim())
}

struct Group {
    members: Vec<usize>,
    weight: f64,
    best_priority: u32,
}

#[derive(Clone)]
pub struct Aggregator {
    equivalence: Equivalence,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            equivalence: trimmed_equality(),
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

impl Aggregator {
    pub fn new(equivalence: Equivalence) -> Self {
        Self { equivalence }
    }

    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        (self.equivalence)(a, b)
    }

    /// Merge `results` into one [`SwarmResult`].
    ///
    /// The returned result reports `ParallelConsensus` at level `Normal`;
    /// the strategy engine overwrites both with what actually ran.
    pub fn aggregate(
        &self,
        task_id: TaskId,
        mut results: Vec<InvocationResult>,
        algorithm: Algorithm,
        quorum: Quorum,
    ) -> SwarmResult {
        if algorithm != Algorithm::Final {
            results.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.role.cmp(&b.role)));
        }

        let dispatched = results.len();
        let cancelled = results
            .iter()
            .any(|r| r.error().is_some_and(|e| e.is_cancellation()));

        let mut contributions = Vec::new();
        let mut failures = Vec::new();
        let mut successes: Vec<&InvocationResult> = Vec::new();
        for r in &results {
            match &r.outcome {
                Ok(output) => {
                    successes.push(r);
                    contributions.push(Contribution {
                        role: r.role.clone(),
                        provider_id: r.provider_id.clone(),
                        tier: None,
                        round: None,
                        content: output.content.clone(),
                        severity: output.severity,
                        latency_ms: r.latency.as_millis() as u64,
                        token_cost: r.token_cost,
                        attempts: r.attempts,
                    });
                }
                Err(error) => failures.push(AgentFailure {
                    role: r.role.clone(),
                    provider_id: r.provider_id.clone(),
                    tier: None,
                    round: None,
                    error: error.clone(),
                    latency_ms: r.latency.as_millis() as u64,
                    attempts: r.attempts,
                }),
            }
        }

        let mut result = SwarmResult {
            task_id,
            status: ResultStatus::Failure,
            payload: None,
            confidence: 0.0,
            strategy: StrategyKind::ParallelConsensus,
            degraded_from: None,
            level: DegradationLevel::Normal,
            contributions,
            failures,
            failure_reason: Some(FailureReason::AggregationFailure),
            escalation_path: Vec::new(),
            timing: Timing::default(),
        };

        if successes.is_empty() {
            tracing::debug!(task_id = %task_id, dispatched, "No successful results to aggregate");
            return result;
        }

        let (payload, confidence, quorum_met) = match algorithm {
            Algorithm::Final => {
                let last = successes[successes.len() - 1];
                (last.content().unwrap_or_default().to_string(), 1.0, true)
            }
            Algorithm::Majority | Algorithm::Weighted => {
                let groups = self.group(&successes);
                let winner = Self::pick(&groups, algorithm);
                let total_weight: f64 = successes.iter().map(|r| r.weight).sum();
                let confidence = match algorithm {
                    Algorithm::Weighted if total_weight > 0.0 => winner.weight / total_weight,
                    _ => winner.members.len() as f64 / successes.len() as f64,
                };
                let payload = successes[winner.members[0]]
                    .content()
                    .unwrap_or_default()
                    .to_string();
                (
                    payload,
                    confidence,
                    successes.len() >= quorum.required(dispatched),
                )
            }
        };

        result.payload = Some(payload);
        result.confidence = confidence;
        result.failure_reason = None;
        result.status = if quorum_met && !cancelled {
            ResultStatus::Success
        } else {
            ResultStatus::Partial
        };
        result
    }

    fn group(&self, successes: &[&InvocationResult]) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for (i, r) in successes.iter().enumerate() {
            let content = r.content().unwrap_or_default();
            let existing = groups.iter_mut().find(|g| {
                self.equivalent(successes[g.members[0]].content().unwrap_or_default(), content)
            });
            match existing {
                Some(g) => {
                    g.members.push(i);
                    g.weight += r.weight;
                    g.best_priority = g.best_priority.min(r.priority);
                }
                None => groups.push(Group {
                    members: vec![i],
                    weight: r.weight,
                    best_priority: r.priority,
                }),
            }
        }
        groups
    }

    fn pick(groups: &[Group], algorithm: Algorithm) -> &Group {
        let mut best = &groups[0];
        for g in &groups[1..] {
            let better = match algorithm {
                Algorithm::Weighted => {
                    let diff = g.weight - best.weight;
                    diff > 1e-9 || (diff.abs() <= 1e-9 && g.best_priority < best.best_priority)
                }
                _ => {
                    g.members.len() > best.members.len()
                        || (g.members.len() == best.members.len()
                            && g.best_priority < best.best_priority)
                }
            };
            if better {
                best = g;
            }
        }
        best
    }
}
