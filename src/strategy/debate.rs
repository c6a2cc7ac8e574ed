//! Debate: agents take turns over a shared transcript until two consecutive
//! rounds agree or the round limit is reached.

use crate::aggregate::{Algorithm, Quorum};
use crate::invoker::InvocationResult;
use crate::task::SwarmResult;

use super::{shrink, Dispatch, StrategyEngine};

fn round_prompt(prompt: &str, transcript: &[(u32, String, String)]) -> String {
    if transcript.is_empty() {
        return prompt.to_string();
    }
    let mut out = format!("{}\n\nDebate so far:\n", prompt);
    for (round, role, content) in transcript {
        out.push_str(&format!("[round {}] {}: {}\n", round, role, content));
    }
    out.push_str("\nGive your position. Repeat the previous answer verbatim if you agree with it.");
    out
}

impl StrategyEngine {
    pub(crate) async fn run_debate(&self, d: &Dispatch<'_>, prompt: &str) -> SwarmResult {
        let agents = shrink(d.pool.clone(), d.level());
        d.claim(&agents);
        let max_rounds = d.team.debate.max_rounds.max(1);

        let mut transcript: Vec<(u32, String, String)> = Vec::new();
        let mut results: Vec<(u32, InvocationResult)> = Vec::new();
        let mut previous: Option<String> = None;

        for round in 1..=max_rounds {
            let agent = agents[(round as usize - 1) % agents.len()];
            let r = self.dispatch(agent, &round_prompt(prompt, &transcript), d).await;

            match r.content() {
                Some(content) => {
                    let agreed = previous
                        .as_deref()
                        .is_some_and(|p| self.aggregator.equivalent(p, content));
                    previous = Some(content.to_string());
                    transcript.push((round, r.role.clone(), content.to_string()));
                    results.push((round, r));
                    if agreed {
                        tracing::debug!(task_id = %d.task.id(), round, "Debate converged");
                        break;
                    }
                }
                None => {
                    let stop = r.error().is_some_and(|e| e.is_cancellation());
                    previous = None;
                    results.push((round, r));
                    if stop {
                        break;
                    }
                }
            }
        }

        let rounds = results.len();
        let (ok_rounds, err_rounds): (Vec<u32>, Vec<u32>) = {
            let ok = results.iter().filter(|(_, r)| r.is_ok()).map(|(n, _)| *n).collect();
            let err = results.iter().filter(|(_, r)| !r.is_ok()).map(|(n, _)| *n).collect();
            (ok, err)
        };
        let answers: Vec<String> = results
            .iter()
            .filter_map(|(_, r)| r.content().map(str::to_string))
            .collect();

        let mut result = self.aggregator.aggregate(
            d.task.id(),
            results.into_iter().map(|(_, r)| r).collect(),
            Algorithm::Final,
            Quorum::AtLeast(1),
        );
        for (c, round) in result.contributions.iter_mut().zip(ok_rounds) {
            c.round = Some(round);
        }
        for (f, round) in result.failures.iter_mut().zip(err_rounds) {
            f.round = Some(round);
        }
        if let Some(payload) = result.payload.as_deref() {
            let agreeing = answers
                .iter()
                .filter(|a| self.aggregator.equivalent(a, payload))
                .count();
            result.confidence = agreeing as f64 / answers.len() as f64;
        }

        tracing::debug!(
            task_id = %d.task.id(),
            rounds,
            confidence = result.confidence,
            "Debate finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agents::Team;
    use crate::provider::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::strategy::{StrategyEngine, StrategyKind};
    use crate::task::{ResultStatus, Task, TaskScope};
    use crate::testing::{agent, context, ScriptedProvider, Step};

    fn run_setup(a: &Arc<ScriptedProvider>, b: &Arc<ScriptedProvider>, rounds: u32) -> (StrategyEngine, Team) {
        let ctx = context(&[a.clone(), b.clone()]);
        let engine = StrategyEngine::new(ctx, RetryPolicy::none());
        let mut team = Team::new("panel", vec![agent("pro", "a", 1), agent("con", "b", 2)])
            .with_strategy(StrategyKind::Debate);
        team.debate.max_rounds = rounds;
        (engine, team)
    }

    fn task() -> Task {
        Task::builder("panel", "Should we migrate?")
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_consecutive_rounds_agree() {
        let a = ScriptedProvider::replying("a", "migrate");
        let b = ScriptedProvider::replying("b", "migrate");
        let (engine, team) = run_setup(&a, &b, 5);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.strategy, StrategyKind::Debate);
        assert_eq!(result.payload.as_deref(), Some("migrate"));
        assert_eq!(result.contributions.len(), 2);
        assert_eq!(result.contributions[1].round, Some(2));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(a.calls() + b.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_max_rounds_and_feeds_transcript() {
        let a = ScriptedProvider::replying("a", "yes");
        let b = ScriptedProvider::replying("b", "no");
        let (engine, team) = run_setup(&a, &b, 3);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.payload.as_deref(), Some("yes"));
        assert_eq!(result.contributions.len(), 3);
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);
        assert!((result.confidence - 2.0 / 3.0).abs() < 1e-9);

        assert_eq!(a.prompts()[0], "Should we migrate?");
        assert!(b.prompts()[0].contains("[round 1] pro: yes"));
        assert!(a.prompts()[1].contains("[round 2] con: no"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_resets_agreement() {
        let a = ScriptedProvider::replying("a", "same");
        let b = ScriptedProvider::new("b", Step::Fail(ProviderError::Auth("revoked".into())));
        let (engine, team) = run_setup(&a, &b, 3);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("same"));
        assert_eq!(result.contributions.len(), 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].round, Some(2));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_debate_partial() {
        let a = ScriptedProvider::replying("a", "first");
        let b = ScriptedProvider::new("b", Step::Hang);
        let (engine, mut team) = run_setup(&a, &b, 3);
        team.agents[1] = agent("con", "b", 2).with_timeout(Duration::from_secs(600));
        let task = Task::builder("panel", "Should we migrate?")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.payload.as_deref(), Some("first"));
        assert_eq!(a.calls(), 1);
    }
}
