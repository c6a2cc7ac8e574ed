//! API request and response types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::DegradationLevel;
use crate::provider::CallParams;
use crate::strategy::StrategyKind;
use crate::task::{Task, TaskError, TaskId};

/// Request to run a task on a team.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    /// Team that should handle the task
    pub team: String,

    /// The prompt sent to the agents
    pub payload: String,

    /// Capability tags every dispatched agent must have
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Deadline relative to submission (uses the orchestrator default if not specified)
    pub timeout_ms: Option<u64>,

    /// Strategy override (uses the team's strategy if not specified)
    pub strategy: Option<StrategyKind>,

    /// Optional model override for agents without their own
    pub model: Option<String>,

    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl SubmitTaskRequest {
    pub fn into_task(self, default_timeout: Duration) -> Result<Task, TaskError> {
        let timeout = self
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        Task::builder(self.team, self.payload)
            .capabilities(self.capabilities)
            .timeout(timeout)
            .maybe_strategy(self.strategy)
            .params(CallParams {
                model: self.model,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            })
            .build()
    }
}

/// Response after submitting an asynchronous task.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitAsyncResponse {
    pub id: TaskId,
    pub status: &'static str,
}

/// Response for a task that has not finished yet.
#[derive(Debug, Clone, Serialize)]
pub struct PendingResponse {
    pub id: TaskId,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub id: TaskId,
    /// False when the task was unknown or had already finished
    pub cancelled: bool,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Current degradation level
    pub level: DegradationLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadResponse {
    /// Number of providers with budgets in the reloaded file
    pub providers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: SubmitTaskRequest =
            serde_json::from_str(r#"{"team": "review", "payload": "Approve?"}"#).unwrap();
        assert!(req.capabilities.is_empty());
        assert_eq!(req.strategy, None);

        let task = req.into_task(Duration::from_secs(30)).unwrap();
        assert_eq!(task.team(), "review");
        assert_eq!(task.strategy(), None);
    }

    #[test]
    fn test_request_overrides() {
        let req: SubmitTaskRequest = serde_json::from_str(
            r#"{"team": "t", "payload": "p", "capabilities": ["legal"], "strategy": "debate", "max_tokens": 64}"#,
        )
        .unwrap();
        let task = req.into_task(Duration::from_secs(30)).unwrap();
        assert_eq!(task.strategy(), Some(StrategyKind::Debate));
        assert!(task.required_capabilities().contains("legal"));
        assert_eq!(task.params().max_tokens, Some(64));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let req: SubmitTaskRequest =
            serde_json::from_str(r#"{"team": "t", "payload": ""}"#).unwrap();
        assert!(matches!(
            req.into_task(Duration::from_secs(30)),
            Err(TaskError::EmptyPayload)
        ));
    }
}
