//! Quality gate: a primary agent drafts, a reviewer scores the draft, and a
//! draft below the threshold gets one revision carrying the critique.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::agents::Agent;
use crate::aggregate::{Algorithm, Quorum};
use crate::invoker::InvocationResult;
use crate::task::{ResultStatus, SwarmResult};

use super::{Dispatch, StrategyEngine};

fn number_regex() -> Option<&'static Regex> {
    static NUMBER_RE: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBER_RE
        .get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").ok())
        .as_ref()
}

/// Map a raw score onto `[0, 1]`, accepting 0–1, 0–10 and 0–100 scales.
fn normalize(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw < 0.0 {
        None
    } else if raw <= 1.0 {
        Some(raw)
    } else if raw <= 10.0 {
        Some(raw / 10.0)
    } else if raw <= 100.0 {
        Some(raw / 100.0)
    } else {
        None
    }
}

fn json_score(value: &Value) -> Option<f64> {
    match value.get("score")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract a review score in `[0, 1]` from reviewer output.
///
/// Prefers a JSON `score` field (the whole reply or the first `{...}` block
/// inside it), then falls back to the first number in the text.
pub fn parse_score(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let json = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
    });
    if let Some(score) = json.as_ref().and_then(json_score) {
        return normalize(score);
    }

    let m = number_regex()?.find(trimmed)?;
    m.as_str().parse::<f64>().ok().and_then(normalize)
}

fn critique(text: &str) -> String {
    let trimmed = text.trim();
    let parsed = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        serde_json::from_str::<Value>(trimmed.get(start..=end)?).ok()
    });
    parsed
        .as_ref()
        .and_then(|v| v.get("critique"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| trimmed.to_string())
}

fn review_prompt(prompt: &str, draft: &str) -> String {
    format!(
        "Review the answer below for correctness and completeness.\n\
         Reply with JSON: {{\"score\": <0.0-1.0>, \"critique\": \"<what to improve>\"}}\n\n\
         Task:\n{}\n\nAnswer:\n{}",
        prompt, draft
    )
}

fn revision_prompt(prompt: &str, draft: &str, critique: &str) -> String {
    format!(
        "{}\n\nYour previous answer:\n{}\n\nReviewer critique:\n{}\n\nRevise the answer to address the critique.",
        prompt, draft, critique
    )
}

impl StrategyEngine {
    fn quality_roles<'a>(&self, d: &Dispatch<'a>) -> (Option<&'a Agent>, Option<&'a Agent>) {
        let quality = &d.team.quality;
        let by_role = |role: &Option<String>| {
            role.as_ref()
                .and_then(|r| d.pool.iter().copied().find(|a| &a.role == r))
        };

        let primary = by_role(&quality.primary).or_else(|| d.pool.first().copied());
        let reviewer = by_role(&quality.reviewer).or_else(|| {
            d.pool
                .iter()
                .copied()
                .find(|a| primary.map_or(true, |p| p.role != a.role))
        });
        (primary, reviewer)
    }

    /// Aggregate the calls made so far with `answer`'s content as the payload.
    fn gate_result(
        &self,
        d: &Dispatch<'_>,
        calls: Vec<InvocationResult>,
        answer: &InvocationResult,
        status: ResultStatus,
        confidence: f64,
    ) -> SwarmResult {
        let mut result = self
            .aggregator
            .aggregate(d.task.id(), calls, Algorithm::Final, Quorum::AtLeast(1));
        if let Some(content) = answer.content() {
            result.payload = Some(content.to_string());
            result.status = status;
            result.confidence = confidence;
            result.failure_reason = None;
        }
        result
    }

    pub(crate) async fn run_quality_gate(&self, d: &Dispatch<'_>, prompt: &str) -> SwarmResult {
        let threshold = d.team.quality.threshold;
        let (Some(primary), reviewer) = self.quality_roles(d) else {
            return self
                .aggregator
                .aggregate(d.task.id(), Vec::new(), Algorithm::Final, Quorum::AtLeast(1));
        };
        let mut claimed = vec![primary];
        claimed.extend(reviewer);
        d.claim(&claimed);

        let draft = self.dispatch(primary, prompt, d).await;
        let Some(draft_text) = draft.content().map(str::to_string) else {
            return self
                .aggregator
                .aggregate(d.task.id(), vec![draft], Algorithm::Final, Quorum::AtLeast(1));
        };

        let Some(reviewer) = reviewer else {
            tracing::debug!(task_id = %d.task.id(), "No reviewer available, returning draft");
            let answer = draft.clone();
            return self.gate_result(d, vec![draft], &answer, ResultStatus::Partial, 0.0);
        };

        let review = self.dispatch(reviewer, &review_prompt(prompt, &draft_text), d).await;
        let score = review.content().and_then(parse_score);
        let review_text = review.content().map(str::to_string);

        let Some(score) = score else {
            tracing::warn!(
                task_id = %d.task.id(),
                reviewer = %reviewer.role,
                "Review produced no usable score, returning draft"
            );
            let answer = draft.clone();
            return self.gate_result(d, vec![draft, review], &answer, ResultStatus::Partial, 0.0);
        };

        if score >= threshold {
            tracing::debug!(task_id = %d.task.id(), score, "Draft passed review");
            let answer = draft.clone();
            return self.gate_result(d, vec![draft, review], &answer, ResultStatus::Success, score);
        }

        tracing::info!(task_id = %d.task.id(), score, threshold, "Draft below threshold, revising");
        let feedback = critique(review_text.as_deref().unwrap_or_default());
        let revision = self
            .dispatch(primary, &revision_prompt(prompt, &draft_text, &feedback), d)
            .await;

        if revision.is_ok() {
            let answer = revision.clone();
            self.gate_result(
                d,
                vec![draft, review, revision],
                &answer,
                ResultStatus::Success,
                threshold,
            )
        } else {
            let answer = draft.clone();
            self.gate_result(
                d,
                vec![draft, review, revision],
                &answer,
                ResultStatus::Partial,
                score,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::agents::Team;
    use crate::provider::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::strategy::StrategyKind;
    use crate::task::{Task, TaskScope};
    use crate::testing::{agent, context, ScriptedProvider, Step};

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score(r#"{"score": 0.8, "critique": "fine"}"#), Some(0.8));
        assert_eq!(parse_score(r#"Here you go: {"score": 7} thanks"#), Some(0.7));
        assert_eq!(parse_score(r#"{"score": "85"}"#), Some(0.85));
        assert_eq!(parse_score("I'd rate this 9 out of 10"), Some(0.9));
        assert_eq!(parse_score("score: 0.35"), Some(0.35));
        assert_eq!(parse_score("no idea"), None);
        assert_eq!(parse_score("1500"), None);
    }

    #[test]
    fn test_critique_extraction() {
        assert_eq!(critique(r#"{"score": 0.2, "critique": "add tests"}"#), "add tests");
        assert_eq!(critique("  just prose  "), "just prose");
    }

    fn setup(writer: &Arc<ScriptedProvider>, reviewer: &Arc<ScriptedProvider>) -> (StrategyEngine, Team) {
        let ctx = context(&[writer.clone(), reviewer.clone()]);
        let engine = StrategyEngine::new(ctx, RetryPolicy::none());
        let mut team = Team::new(
            "docs",
            vec![agent("writer", "w", 1), agent("editor", "r", 2)],
        )
        .with_strategy(StrategyKind::QualityGated);
        team.quality.primary = Some("writer".into());
        team.quality.reviewer = Some("editor".into());
        team.quality.threshold = 0.7;
        (engine, team)
    }

    fn task() -> Task {
        Task::builder("docs", "Write the release notes")
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_passing_draft_is_returned() {
        let w = ScriptedProvider::replying("w", "draft v1");
        let r = ScriptedProvider::replying("r", r#"{"score": 0.9, "critique": "good"}"#);
        let (engine, team) = setup(&w, &r);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("draft v1"));
        assert_eq!(result.confidence, 0.9);
        assert_eq!(w.calls(), 1);
        assert!(r.prompts()[0].contains("draft v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_score_triggers_one_revision() {
        let w = ScriptedProvider::replying("w", "draft v2");
        w.push(Step::reply("draft v1"));
        let r = ScriptedProvider::replying("r", r#"{"score": 4, "critique": "mention the API change"}"#);
        let (engine, team) = setup(&w, &r);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("draft v2"));
        assert_eq!(result.confidence, 0.7);
        assert_eq!(w.calls(), 2);
        assert_eq!(r.calls(), 1);
        assert!(w.prompts()[1].contains("mention the API change"));
        assert_eq!(result.contributions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_review_returns_draft_partial() {
        let w = ScriptedProvider::replying("w", "draft v1");
        let r = ScriptedProvider::replying("r", "looks okay I guess");
        let (engine, team) = setup(&w, &r);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.payload.as_deref(), Some("draft v1"));
        assert_eq!(w.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revision_keeps_draft_partial() {
        let w = ScriptedProvider::new("w", Step::Fail(ProviderError::Auth("revoked".into())));
        w.push(Step::reply("draft v1"));
        let r = ScriptedProvider::replying("r", r#"{"score": 0.1}"#);
        let (engine, team) = setup(&w, &r);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.payload.as_deref(), Some("draft v1"));
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_draft_is_failure() {
        let w = ScriptedProvider::new("w", Step::Fail(ProviderError::Auth("revoked".into())));
        let r = ScriptedProvider::replying("r", r#"{"score": 1}"#);
        let (engine, team) = setup(&w, &r);
        let task = task();
        let scope = TaskScope::new(task.deadline());

        let result = engine.execute(&task, &team, &scope).await;
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(r.calls(), 0);
    }
}
