//! Tiered escalation: cheap agents first, deeper tiers only when the answer
//! is uncertain or severe.
//!
//! Each tier is a parallel-consensus sub-call and tiers never overlap. The
//! exhaustive tier is not part of the inline ladder; it runs through
//! [`StrategyEngine::run_exhaustive`].

use chrono::Utc;
use futures::future::join_all;
use tokio::time::Instant;

use crate::agents::{Agent, Team, Tier, TierConfig};
use crate::task::{FailureReason, SwarmResult, Task, TaskScope};

use super::{mark_cancelled, shrink, styled_prompt, Dispatch, StrategyEngine, StrategyKind};

/// Whether a tier result should be escalated to the next tier.
pub(crate) fn needs_escalation(result: &SwarmResult, tiers: &TierConfig) -> bool {
    result.is_failure()
        || result
            .max_severity()
            .is_some_and(|s| s >= tiers.severity_threshold)
        || result.confidence < tiers.min_confidence
}

fn with_context(prompt: &str, label: &str, answer: &str) -> String {
    format!("{}\n\n{}:\n{}", prompt, label, answer)
}

impl StrategyEngine {
    async fn run_tier(&self, d: &Dispatch<'_>, tier: Tier, agents: &[&Agent], prompt: &str) -> SwarmResult {
        d.claim(agents);
        tracing::debug!(
            task_id = %d.task.id(),
            tier = %tier,
            agents = agents.len(),
            "Running tier"
        );
        let results = join_all(agents.iter().map(|a| self.dispatch(a, prompt, d))).await;
        self.aggregator
            .aggregate(d.task.id(), results, d.team.algorithm, d.team.quorum)
            .label_tier(tier)
    }

    fn members<'a>(&self, d: &Dispatch<'a>, tier: Tier) -> Vec<&'a Agent> {
        shrink(d.team.tier_members(tier, &d.pool), d.level())
    }

    pub(crate) async fn run_tiered(&self, d: &Dispatch<'_>, prompt: &str) -> SwarmResult {
        let tiers = &d.team.tiers;

        let mut rapid_agents = self.members(d, Tier::Rapid);
        if rapid_agents.is_empty() {
            rapid_agents.extend(self.best_available(d));
        }
        let mut rapid = self.run_tier(d, Tier::Rapid, &rapid_agents, prompt).await;
        rapid.escalation_path = vec![Tier::Rapid];

        if !needs_escalation(&rapid, tiers) {
            return rapid;
        }
        if d.scope.is_cancelled() {
            rapid.downgrade();
            return rapid;
        }

        let deep_agents: Vec<&Agent> = self
            .members(d, Tier::Deep)
            .into_iter()
            .filter(|a| !d.is_claimed(&a.role))
            .collect();
        if deep_agents.is_empty() {
            tracing::debug!(task_id = %d.task.id(), "No deep tier to escalate to");
            return rapid;
        }

        tracing::info!(
            task_id = %d.task.id(),
            confidence = rapid.confidence,
            severity = ?rapid.max_severity(),
            failed = rapid.is_failure(),
            "Escalating to deep tier"
        );
        let deep_prompt = match rapid.payload.as_deref() {
            Some(answer) => with_context(prompt, "Initial assessment", answer),
            None => prompt.to_string(),
        };
        let mut deep = self.run_tier(d, Tier::Deep, &deep_agents, &deep_prompt).await;
        let mut path = vec![Tier::Rapid, Tier::Deep];

        if deep.is_failure() {
            // Fall back to the rapid answer, flagged as incomplete.
            let mut result = rapid;
            result.downgrade();
            result.contributions.extend(deep.contributions);
            result.failures.extend(deep.failures);
            result.escalation_path = path;
            return result;
        }
        deep.merge_audit(rapid);

        let validators: Vec<&Agent> = self
            .members(d, Tier::Validation)
            .into_iter()
            .filter(|a| !d.is_claimed(&a.role))
            .collect();
        if needs_escalation(&deep, tiers) && !validators.is_empty() && !d.scope.is_cancelled() {
            path.push(Tier::Validation);
            let validation = self.run_tier(d, Tier::Validation, &validators, prompt).await;
            let agrees = match (validation.payload.as_deref(), deep.payload.as_deref()) {
                (Some(v), Some(answer)) => Some(self.aggregator.equivalent(v, answer)),
                _ => None,
            };
            match agrees {
                Some(true) => {}
                Some(false) => {
                    tracing::info!(task_id = %d.task.id(), "Validation tier disagrees with deep tier");
                    deep.downgrade();
                }
                None => {
                    tracing::debug!(task_id = %d.task.id(), "Validation tier produced no answer");
                }
            }
            deep.contributions.extend(validation.contributions);
            deep.failures.extend(validation.failures);
        }

        deep.escalation_path = path;
        deep
    }

    /// Run the exhaustive tier for `task`, or every eligible agent when the
    /// team does not name one.
    pub async fn run_exhaustive(&self, task: &Task, team: &Team, scope: &TaskScope) -> SwarmResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let level = self.context().level();
        let d = Dispatch::new(task, team, scope, level);

        let mut agents = d.team.tier_members(Tier::Exhaustive, &d.pool);
        if agents.is_empty() {
            agents = d.pool.clone();
        }
        let agents = shrink(agents, level);

        let mut result = if agents.is_empty() {
            SwarmResult::failure(task.id(), StrategyKind::TieredEscalation, FailureReason::NoCapableAgent)
        } else {
            let prompt = styled_prompt(team.style, task.payload());
            let mut r = self.run_tier(&d, Tier::Exhaustive, &agents, &prompt).await;
            r.escalation_path = vec![Tier::Exhaustive];
            r
        };
        mark_cancelled(&mut result, scope);
        result.strategy = StrategyKind::TieredEscalation;
        result.level = level;
        result.with_timing(started_at, started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agents::{Team, Tier};
    use crate::health::DegradationLevel;
    use crate::provider::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::strategy::{StrategyEngine, StrategyKind};
    use crate::task::{ResultStatus, Task, TaskScope};
    use crate::testing::{agent, context, ScriptedProvider, Step};

    struct Fixture {
        rapid: Arc<ScriptedProvider>,
        deep: Arc<ScriptedProvider>,
        validator: Arc<ScriptedProvider>,
        engine: StrategyEngine,
        team: Team,
    }

    fn fixture(rapid: Step, deep: Step, validator: Step) -> Fixture {
        let rapid = ScriptedProvider::new("rapid", rapid);
        let deep = ScriptedProvider::new("deep", deep);
        let validator = ScriptedProvider::new("val", validator);
        let ctx = context(&[rapid.clone(), deep.clone(), validator.clone()]);
        let engine = StrategyEngine::new(
            ctx,
            RetryPolicy {
                jitter: 0.0,
                base_delay_ms: 10,
                ..RetryPolicy::default()
            },
        );
        let mut team = Team::new(
            "triage",
            vec![agent("r", "rapid", 1), agent("d", "deep", 2), agent("v", "val", 3)],
        )
        .with_strategy(StrategyKind::TieredEscalation);
        team.tiers.rapid = vec!["r".into()];
        team.tiers.deep = vec!["d".into()];
        team.tiers.validation = vec!["v".into()];
        Fixture {
            rapid,
            deep,
            validator,
            engine,
            team,
        }
    }

    fn task() -> Task {
        Task::builder("triage", "Assess this incident")
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_severity_never_calls_deep_tier() {
        let f = fixture(
            Step::ReplyWithSeverity("minor".into(), 0.1),
            Step::reply("deep"),
            Step::reply("val"),
        );
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("minor"));
        assert_eq!(result.escalation_path, vec![Tier::Rapid]);
        assert_eq!(f.rapid.calls(), 1);
        assert_eq!(f.deep.calls(), 0);
        assert_eq!(f.validator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_severity_escalates_with_rapid_context() {
        let f = fixture(
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::ReplyWithSeverity("confirmed outage".into(), 0.2),
            Step::reply("val"),
        );
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("confirmed outage"));
        assert_eq!(result.escalation_path, vec![Tier::Rapid, Tier::Deep]);
        assert_eq!(f.validator.calls(), 0);
        assert!(f.deep.prompts()[0].contains("Initial assessment:\nlooks bad"));

        let tiers: Vec<_> = result.contributions.iter().map(|c| c.tier).collect();
        assert_eq!(tiers, vec![Some(Tier::Rapid), Some(Tier::Deep)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_substitute_is_not_reused_by_deep_tier() {
        let f = fixture(
            Step::reply("never"),
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::reply("val"),
        );
        let circuits = &f.engine.context().circuits;
        while let Ok(pass) = circuits.try_acquire("rapid") {
            pass.record_failure();
        }
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.payload.as_deref(), Some("looks bad"));
        assert_eq!(result.escalation_path, vec![Tier::Rapid]);
        assert_eq!(f.rapid.calls(), 0);
        assert_eq!(f.deep.calls(), 1);
        assert_eq!(f.validator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_failure_returns_rapid_answer_as_partial() {
        let f = fixture(
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::Fail(ProviderError::Auth("revoked".into())),
            Step::reply("val"),
        );
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.payload.as_deref(), Some("looks bad"));
        assert_eq!(result.escalation_path, vec![Tier::Rapid, Tier::Deep]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].tier, Some(Tier::Deep));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_disagreement_downgrades() {
        let f = fixture(
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::ReplyWithSeverity("outage".into(), 0.95),
            Step::reply("false alarm"),
        );
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.payload.as_deref(), Some("outage"));
        assert_eq!(
            result.escalation_path,
            vec![Tier::Rapid, Tier::Deep, Tier::Validation]
        );
        assert_eq!(f.validator.calls(), 1);
        assert_eq!(result.contributions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_agreement_keeps_success() {
        let f = fixture(
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::ReplyWithSeverity("outage".into(), 0.95),
            Step::reply("outage"),
        );
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("outage"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimal_level_falls_back_to_single_agent() {
        let f = fixture(
            Step::ReplyWithSeverity("looks bad".into(), 0.9),
            Step::reply("deep"),
            Step::reply("val"),
        );
        f.engine.context().health.force_level(DegradationLevel::Minimal);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.execute(&task, &f.team, &scope).await;
        assert_eq!(result.strategy, StrategyKind::SingleAgent);
        assert_eq!(result.degraded_from, Some(StrategyKind::TieredEscalation));
        assert_eq!(result.payload.as_deref(), Some("looks bad"));
        assert_eq!(f.deep.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustive_runs_named_tier_only() {
        let mut f = fixture(Step::reply("a"), Step::reply("b"), Step::reply("b"));
        f.team.tiers.exhaustive = vec!["d".into(), "v".into()];
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = f.engine.run_exhaustive(&task, &f.team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("b"));
        assert_eq!(result.escalation_path, vec![Tier::Exhaustive]);
        assert_eq!(f.rapid.calls(), 0);
        assert!(result
            .contributions
            .iter()
            .all(|c| c.tier == Some(Tier::Exhaustive)));
    }
}
