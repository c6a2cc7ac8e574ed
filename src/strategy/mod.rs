//! Execution strategy engine.
//!
//! Decides how many agents run for a task, in what order, and when to stop:
//! - **Parallel-Consensus**: every eligible agent at once, then aggregate
//! - **Tiered-Escalation**: a rapid tier first, deeper tiers only when needed
//! - **Debate**: sequential rounds over a shared transcript
//! - **Quality-Gated**: draft, review, and at most one revision
//! - **Single-Agent**: one call to the best available agent
//!
//! The engine owns the retry loop: transient errors are retried with backoff,
//! and an open circuit hands the slot to an unused agent when the team allows.

mod consensus;
mod debate;
mod escalation;
mod quality;

pub use quality::parse_score;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agents::{Agent, ResponseStyle, Team};
use crate::aggregate::Aggregator;
use crate::context::SwarmContext;
use crate::error::InvocationError;
use crate::health::DegradationLevel;
use crate::invoker::{AgentInvoker, InvocationResult};
use crate::retry::RetryPolicy;
use crate::task::{FailureReason, SwarmResult, Task, TaskScope};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    ParallelConsensus,
    TieredEscalation,
    Debate,
    QualityGated,
    /// One call to the lowest-priority agent with a closed circuit
    SingleAgent,
}

impl StrategyKind {
    /// Strategies that need several sequential rounds.
    pub fn is_multi_round(&self) -> bool {
        matches!(self, StrategyKind::TieredEscalation | StrategyKind::Debate)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::ParallelConsensus => write!(f, "parallel_consensus"),
            StrategyKind::TieredEscalation => write!(f, "tiered_escalation"),
            StrategyKind::Debate => write!(f, "debate"),
            StrategyKind::QualityGated => write!(f, "quality_gated"),
            StrategyKind::SingleAgent => write!(f, "single_agent"),
        }
    }
}

/// Strategy that actually runs for `requested` at `level`.
pub fn effective_strategy(requested: StrategyKind, level: DegradationLevel) -> StrategyKind {
    match level {
        DegradationLevel::Maintenance => StrategyKind::SingleAgent,
        _ if requested.is_multi_round() && !level.allows_multi_round() => StrategyKind::SingleAgent,
        _ => requested,
    }
}

/// Keep the first ⌈n/2⌉ agents once the swarm is degraded.
pub(crate) fn shrink<'a>(agents: Vec<&'a Agent>, level: DegradationLevel) -> Vec<&'a Agent> {
    if level >= DegradationLevel::Degraded && agents.len() > 1 {
        let keep = agents.len().div_ceil(2);
        agents.into_iter().take(keep).collect()
    } else {
        agents
    }
}

pub(crate) fn styled_prompt(style: ResponseStyle, payload: &str) -> String {
    match style.instruction() {
        Some(instruction) => format!("{}\n\n{}", instruction, payload),
        None => payload.to_string(),
    }
}

/// A failed result whose scope ended reports the deadline or the cancel as its reason.
pub(crate) fn mark_cancelled(result: &mut SwarmResult, scope: &TaskScope) {
    if result.is_failure() && scope.is_cancelled() {
        result.failure_reason = Some(match scope.cancellation_error() {
            InvocationError::TaskTimeout => FailureReason::TaskTimeout,
            _ => FailureReason::Cancelled,
        });
    }
}

/// Per-task state shared by every dispatch of one strategy run.
pub(crate) struct Dispatch<'a> {
    pub task: &'a Task,
    pub team: &'a Team,
    pub scope: &'a TaskScope,
    /// Eligible agents, ordered by `(priority, role)`
    pub pool: Vec<&'a Agent>,
    level: DegradationLevel,
    used: Mutex<HashSet<String>>,
}

impl<'a> Dispatch<'a> {
    pub fn new(task: &'a Task, team: &'a Team, scope: &'a TaskScope, level: DegradationLevel) -> Self {
        Self {
            task,
            team,
            scope,
            pool: team.eligible(task.required_capabilities()),
            level,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.level
    }

    /// Mark roles as taken so they are never picked as substitutes.
    pub fn claim(&self, agents: &[&Agent]) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        for a in agents {
            used.insert(a.role.clone());
        }
    }

    /// Whether `role` was already dispatched in this run, directly or as a substitute.
    pub fn is_claimed(&self, role: &str) -> bool {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(role)
    }
}

pub struct StrategyEngine {
    invoker: AgentInvoker,
    aggregator: Aggregator,
    retry: RetryPolicy,
}

impl StrategyEngine {
    pub fn new(ctx: Arc<SwarmContext>, retry: RetryPolicy) -> Self {
        Self {
            invoker: AgentInvoker::new(ctx),
            aggregator: Aggregator::default(),
            retry,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn context(&self) -> &Arc<SwarmContext> {
        self.invoker.context()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Run `task` on `team` with the task's strategy (or the team default).
    pub async fn execute(&self, task: &Task, team: &Team, scope: &TaskScope) -> SwarmResult {
        let started_at = Utc::now();
        let started = Instant::now();

        let requested = task.strategy().unwrap_or(team.strategy);
        let level = self.context().level();
        let strategy = effective_strategy(requested, level);
        let dispatch = Dispatch::new(task, team, scope, level);

        tracing::info!(
            task_id = %task.id(),
            team = %team.name,
            strategy = %strategy,
            level = %level,
            eligible = dispatch.pool.len(),
            "Executing task"
        );

        let mut result = if dispatch.pool.is_empty() {
            SwarmResult::failure(task.id(), strategy, FailureReason::NoCapableAgent)
        } else {
            let prompt = styled_prompt(team.style, task.payload());
            match strategy {
                StrategyKind::ParallelConsensus => self.run_consensus(&dispatch, &prompt).await,
                StrategyKind::TieredEscalation => self.run_tiered(&dispatch, &prompt).await,
                StrategyKind::Debate => self.run_debate(&dispatch, &prompt).await,
                StrategyKind::QualityGated => self.run_quality_gate(&dispatch, &prompt).await,
                StrategyKind::SingleAgent => self.run_single(&dispatch, &prompt).await,
            }
        };

        mark_cancelled(&mut result, scope);
        result.strategy = strategy;
        result.level = level;
        if strategy != requested {
            result.degraded_from = Some(requested);
            tracing::info!(
                task_id = %task.id(),
                requested = %requested,
                ran = %strategy,
                "Strategy degraded"
            );
        }
        result.with_timing(started_at, started.elapsed())
    }

    /// Call one agent with retries and, on an open circuit, substitution.
    pub(crate) async fn dispatch(&self, agent: &Agent, prompt: &str, d: &Dispatch<'_>) -> InvocationResult {
        let started = Instant::now();
        let ctx = self.context();
        let mut current: &Agent = agent;
        let mut attempt = 1u32;
        let mut tokens = 0u64;

        loop {
            let timeout = current.timeout().unwrap_or_else(|| ctx.default_call_timeout());
            let mut result = self
                .invoker
                .invoke(current, prompt, d.task.params(), timeout, d.scope)
                .await;
            tokens += result.token_cost;
            result.token_cost = tokens;
            result.attempts = attempt;
            result.latency = started.elapsed();

            let Some(error) = result.error() else {
                return result;
            };
            if error.is_cancellation() {
                return result;
            }

            if error.kind().should_substitute() {
                if !d.team.allow_substitution {
                    return result;
                }
                match self.substitute(current, d) {
                    Some(next) => {
                        tracing::info!(
                            task_id = %d.task.id(),
                            from = %current.role,
                            to = %next.role,
                            provider = %next.provider_id,
                            "Substituting agent for open circuit"
                        );
                        current = next;
                        attempt = 1;
                        continue;
                    }
                    None => return result,
                }
            }

            let Some(delay) = self.retry.delay_for(error, attempt) else {
                return result;
            };
            if delay >= d.scope.remaining() {
                return result;
            }
            tracing::debug!(
                task_id = %d.task.id(),
                role = %current.role,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying agent call"
            );
            tokio::select! {
                _ = d.scope.cancelled() => {
                    result.outcome = Err(d.scope.cancellation_error());
                    result.latency = started.elapsed();
                    return result;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Unused eligible agent, lowest priority first, whose circuit would admit a call.
    fn substitute<'a>(&self, failed: &Agent, d: &Dispatch<'a>) -> Option<&'a Agent> {
        let mut used = d.used.lock().unwrap_or_else(|e| e.into_inner());
        used.insert(failed.role.clone());
        let next = d.pool.iter().copied().find(|a| {
            !used.contains(&a.role) && self.context().circuits.is_available(&a.provider_id)
        })?;
        used.insert(next.role.clone());
        Some(next)
    }

    /// Lowest-priority eligible agent whose circuit is closed (or the first eligible).
    pub(crate) fn best_available<'a>(&self, d: &Dispatch<'a>) -> Option<&'a Agent> {
        d.pool
            .iter()
            .copied()
            .find(|a| self.context().circuits.is_available(&a.provider_id))
            .or_else(|| d.pool.first().copied())
    }
}
