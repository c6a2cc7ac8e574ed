//! Task orchestrator: the public entry point of a swarm.
//!
//! Resolves the team, applies the maintenance veto, runs the strategy engine
//! under a [`TaskScope`], and keeps asynchronous results until they are polled
//! or their retention period runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agents::{Team, TeamRegistry};
use crate::aggregate::Aggregator;
use crate::config::SwarmConfig;
use crate::context::{HealthSnapshot, SwarmContext};
use crate::error::SwarmError;
use crate::health::DegradationLevel;
use crate::retry::RetryPolicy;
use crate::strategy::{StrategyEngine, StrategyKind};
use crate::task::{FailureReason, SwarmResult, Task, TaskId, TaskScope};

/// Outcome of polling an asynchronous task.
#[derive(Debug, Clone)]
pub enum TaskPoll {
    Pending,
    Ready(SwarmResult),
}

enum EntryState {
    Running,
    Done {
        result: SwarmResult,
        finished_at: Instant,
    },
}

impl EntryState {
    fn done(result: SwarmResult) -> Self {
        EntryState::Done {
            result,
            finished_at: Instant::now(),
        }
    }
}

struct TaskEntry {
    token: CancellationToken,
    state: EntryState,
}

/// Orchestrator-level status.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub health: HealthSnapshot,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub teams: Vec<String>,
}

pub struct Orchestrator {
    ctx: Arc<SwarmContext>,
    engine: Arc<StrategyEngine>,
    teams: TeamRegistry,
    tasks: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
    retry: RetryPolicy,
    reject_in_maintenance: bool,
    task_timeout: Duration,
    result_retention: Duration,
}

impl Orchestrator {
    pub fn new(ctx: Arc<SwarmContext>, config: &SwarmConfig) -> Self {
        Self {
            engine: Arc::new(StrategyEngine::new(ctx.clone(), config.retry.clone())),
            ctx,
            teams: TeamRegistry::new(config.teams.clone()),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            retry: config.retry.clone(),
            reject_in_maintenance: config.orchestrator.reject_in_maintenance,
            task_timeout: config.orchestrator.task_timeout(),
            result_retention: config.orchestrator.result_retention(),
        }
    }

    /// Replace the output equivalence used for grouping and agreement checks.
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.engine = Arc::new(
            StrategyEngine::new(self.ctx.clone(), self.retry.clone()).with_aggregator(aggregator),
        );
        self
    }

    pub fn context(&self) -> &Arc<SwarmContext> {
        &self.ctx
    }

    pub fn teams(&self) -> &TeamRegistry {
        &self.teams
    }

    /// Default timeout for tasks built without one.
    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Resolve the team or produce the failure the caller gets instead.
    fn admit(&self, task: &Task) -> Result<Arc<Team>, SwarmResult> {
        let strategy = task.strategy().unwrap_or_default();
        let Some(team) = self.teams.get(task.team()) else {
            tracing::warn!(task_id = %task.id(), team = %task.team(), "Task submitted to unknown team");
            return Err(SwarmResult::failure(
                task.id(),
                strategy,
                FailureReason::UnknownTeam {
                    team: task.team().to_string(),
                },
            ));
        };

        let level = self.ctx.level();
        if self.reject_in_maintenance && level == DegradationLevel::Maintenance {
            tracing::warn!(task_id = %task.id(), team = %team.name, "Rejecting task during maintenance");
            let mut result = SwarmResult::failure(
                task.id(),
                task.strategy().unwrap_or(team.strategy),
                FailureReason::Rejected { level },
            );
            result.level = level;
            return Err(result);
        }
        Ok(team)
    }

    /// Run `task` to completion and return its result.
    pub async fn submit(&self, task: Task) -> SwarmResult {
        let team = match self.admit(&task) {
            Ok(team) => team,
            Err(rejected) => return rejected,
        };
        let scope = TaskScope::new(task.deadline());
        self.engine.execute(&task, &team, &scope).await
    }

    /// Drop finished results nobody collected within the retention period.
    fn sweep(&self, tasks: &mut HashMap<TaskId, TaskEntry>) {
        let before = tasks.len();
        tasks.retain(|_, entry| match &entry.state {
            EntryState::Running => true,
            EntryState::Done { finished_at, .. } => finished_at.elapsed() < self.result_retention,
        });
        let dropped = before - tasks.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped uncollected task results");
        }
    }

    /// Start `task` in the background. The result is kept until [`poll`](Self::poll)
    /// delivers it or the retention period passes.
    pub async fn submit_async(&self, task: Task) -> Result<TaskId, SwarmError> {
        let id = task.id();
        let token = CancellationToken::new();

        let team = {
            let mut tasks = self.tasks.write().await;
            self.sweep(&mut tasks);
            if tasks.contains_key(&id) {
                return Err(SwarmError::DuplicateTask(id));
            }
            match self.admit(&task) {
                Ok(team) => {
                    tasks.insert(
                        id,
                        TaskEntry {
                            token: token.clone(),
                            state: EntryState::Running,
                        },
                    );
                    team
                }
                Err(rejected) => {
                    tasks.insert(
                        id,
                        TaskEntry {
                            token,
                            state: EntryState::done(rejected),
                        },
                    );
                    return Ok(id);
                }
            }
        };

        let strategy = task.strategy().unwrap_or(team.strategy);
        let engine = Arc::clone(&self.engine);
        let worker = tokio::spawn(async move {
            let scope = TaskScope::with_token(token, task.deadline());
            engine.execute(&task, &team, &scope).await
        });

        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => {
                    tracing::info!(
                        task_id = %id,
                        status = ?result.status,
                        elapsed_ms = result.timing.elapsed_ms,
                        "Async task finished"
                    );
                    result
                }
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Async task worker died");
                    SwarmResult::failure(id, strategy, FailureReason::Aborted)
                }
            };
            if let Some(entry) = tasks.write().await.get_mut(&id) {
                entry.state = EntryState::done(result);
            }
        });

        Ok(id)
    }

    /// Check an asynchronous task. A ready result is handed out once and then forgotten.
    pub async fn poll(&self, id: TaskId) -> Result<TaskPoll, SwarmError> {
        let mut tasks = self.tasks.write().await;
        self.sweep(&mut tasks);
        let done = match tasks.get(&id) {
            None => return Err(SwarmError::TaskNotFound(id)),
            Some(entry) => matches!(entry.state, EntryState::Done { .. }),
        };
        if !done {
            return Ok(TaskPoll::Pending);
        }
        match tasks.remove(&id) {
            Some(TaskEntry {
                state: EntryState::Done { result, .. },
                ..
            }) => Ok(TaskPoll::Ready(result)),
            _ => Err(SwarmError::TaskNotFound(id)),
        }
    }

    /// Cancel a running task. Returns `false` when the task is unknown or already finished.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let tasks = self.tasks.read().await;
        match tasks.get(&id) {
            Some(entry) if matches!(entry.state, EntryState::Running) => {
                tracing::info!(task_id = %id, "Cancelling task");
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let (running_tasks, completed_tasks) = {
            let mut tasks = self.tasks.write().await;
            self.sweep(&mut tasks);
            let running = tasks
                .values()
                .filter(|e| matches!(e.state, EntryState::Running))
                .count();
            (running, tasks.len() - running)
        };
        OrchestratorStatus {
            health: self.ctx.snapshot(),
            running_tasks,
            completed_tasks,
            teams: self.teams.names(),
        }
    }

    /// Apply new provider budgets without restarting.
    pub fn reload_budgets(&self, config: &SwarmConfig) {
        self.ctx.reload_budgets(config);
        tracing::info!(providers = config.providers.len(), "Reloaded provider budgets");
    }

    /// Run the exhaustive tier for `task` every `period` until `token` fires or
    /// the receiver is dropped. Each run gets a fresh task id and a deadline
    /// one task timeout away.
    pub fn schedule_exhaustive(
        &self,
        task: Task,
        period: Duration,
        token: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::Receiver<SwarmResult>) {
        let (tx, rx) = mpsc::channel(8);
        let engine = Arc::clone(&self.engine);
        let team = self.teams.get(task.team());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let run = task.rerun();
                let result = match &team {
                    Some(team) => {
                        let scope = TaskScope::with_token(token.child_token(), run.deadline());
                        engine.run_exhaustive(&run, team, &scope).await
                    }
                    None => SwarmResult::failure(
                        run.id(),
                        StrategyKind::TieredEscalation,
                        FailureReason::UnknownTeam {
                            team: run.team().to_string(),
                        },
                    ),
                };

                if tx.send(result).await.is_err() {
                    tracing::debug!(team = %task.team(), "Exhaustive schedule receiver dropped");
                    break;
                }
            }
        });

        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Team;
    use crate::provider::ProviderClient;
    use crate::task::ResultStatus;
    use crate::testing::{agent, config_for, context_with, ScriptedProvider, Step};

    fn orchestrator(providers: &[Arc<ScriptedProvider>]) -> Orchestrator {
        let ids: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        let mut config = config_for(&ids);
        config.teams = vec![Team::new(
            "review",
            providers
                .iter()
                .enumerate()
                .map(|(i, p)| agent(&format!("r{}", i), p.id(), i as u32))
                .collect(),
        )];
        let ctx = context_with(&config, providers);
        Orchestrator::new(ctx, &config)
    }

    fn task(timeout: Duration) -> Task {
        Task::builder("review", "Approve?").timeout(timeout).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_runs_team() {
        let orch = orchestrator(&[
            ScriptedProvider::replying("a", "yes"),
            ScriptedProvider::replying("b", "yes"),
        ]);
        let result = orch.submit(task(Duration::from_secs(10))).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.payload.as_deref(), Some("yes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_team_fails() {
        let orch = orchestrator(&[ScriptedProvider::replying("a", "yes")]);
        let task = Task::builder("nobody", "Approve?").build().unwrap();
        let result = orch.submit(task).await;
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(
            result.failure_reason,
            Some(FailureReason::UnknownTeam {
                team: "nobody".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_veto() {
        let a = ScriptedProvider::replying("a", "yes");
        let mut config = config_for(&["a"]);
        config.orchestrator.reject_in_maintenance = true;
        config.teams = vec![Team::new("review", vec![agent("r0", "a", 0)])];
        let ctx = context_with(&config, &[a.clone()]);
        ctx.health.force_level(DegradationLevel::Maintenance);
        let orch = Orchestrator::new(ctx, &config);

        let result = orch.submit(task(Duration::from_secs(10))).await;
        assert_eq!(
            result.failure_reason,
            Some(FailureReason::Rejected {
                level: DegradationLevel::Maintenance
            })
        );
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_poll_delivers_once() {
        let orch = orchestrator(&[ScriptedProvider::new(
            "a",
            Step::Delay(Duration::from_millis(500), "done".into()),
        )]);
        let id = orch.submit_async(task(Duration::from_secs(10))).await.unwrap();
        assert!(matches!(orch.poll(id).await.unwrap(), TaskPoll::Pending));

        tokio::time::sleep(Duration::from_secs(1)).await;
        match orch.poll(id).await.unwrap() {
            TaskPoll::Ready(result) => assert_eq!(result.payload.as_deref(), Some("done")),
            TaskPoll::Pending => panic!("task should have finished"),
        }
        assert!(matches!(orch.poll(id).await, Err(SwarmError::TaskNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_async_submission() {
        let orch = orchestrator(&[ScriptedProvider::new("a", Step::Hang)]);
        let task = task(Duration::from_secs(10));
        let again = Task::builder("review", "Approve?").id(task.id()).build().unwrap();
        orch.submit_async(task).await.unwrap();
        assert!(matches!(
            orch.submit_async(again).await,
            Err(SwarmError::DuplicateTask(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task() {
        let p = ScriptedProvider::new("a", Step::Hang);
        let orch = orchestrator(&[p]);
        let id = orch.submit_async(task(Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(orch.cancel(id).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!orch.cancel(id).await);
        assert!(!orch.cancel(TaskId::new()).await);

        match orch.poll(id).await.unwrap() {
            TaskPoll::Ready(result) => {
                assert_eq!(result.status, ResultStatus::Failure);
                assert_eq!(result.failure_reason, Some(FailureReason::Cancelled));
            }
            TaskPoll::Pending => panic!("cancelled task should be finished"),
        }
        assert_eq!(orch.context().capacity.utilization("a").in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_counts_tasks() {
        let orch = orchestrator(&[ScriptedProvider::new("a", Step::Hang)]);
        orch.submit_async(task(Duration::from_secs(60))).await.unwrap();
        let status = orch.status().await;
        assert_eq!(status.running_tasks, 1);
        assert_eq!(status.completed_tasks, 0);
        assert_eq!(status.teams, vec!["review".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncollected_results_expire() {
        let a = ScriptedProvider::replying("a", "yes");
        let mut config = config_for(&["a"]);
        config.orchestrator.result_retention_ms = 60_000;
        config.teams = vec![Team::new("review", vec![agent("r0", "a", 0)])];
        let orch = Orchestrator::new(context_with(&config, &[a]), &config);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(orch.submit_async(task(Duration::from_secs(10))).await.unwrap());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orch.status().await.completed_tasks, 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = orch.status().await;
        assert_eq!(status.completed_tasks, 0);
        assert_eq!(status.running_tasks, 0);
        assert!(matches!(orch.poll(ids[0]).await, Err(SwarmError::TaskNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_tasks_survive_sweep() {
        let a = ScriptedProvider::new("a", Step::Hang);
        let mut config = config_for(&["a"]);
        config.orchestrator.result_retention_ms = 1_000;
        config.teams = vec![Team::new(
            "review",
            vec![agent("r0", "a", 0).with_timeout(Duration::from_secs(600))],
        )];
        let orch = Orchestrator::new(context_with(&config, &[a]), &config);

        let id = orch.submit_async(task(Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(orch.poll(id).await.unwrap(), TaskPoll::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_marks_task_aborted() {
        let orch = orchestrator(&[ScriptedProvider::new("a", Step::Panic)]);
        let id = orch.submit_async(task(Duration::from_secs(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        match orch.poll(id).await.unwrap() {
            TaskPoll::Ready(result) => {
                assert_eq!(result.status, ResultStatus::Failure);
                assert_eq!(result.failure_reason, Some(FailureReason::Aborted));
            }
            TaskPoll::Pending => panic!("aborted task should be finished"),
        }
        assert_eq!(orch.status().await.running_tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_exhaustive_keeps_task_timeout() {
        let a = ScriptedProvider::new("a", Step::Hang);
        let mut config = config_for(&["a"]);
        config.orchestrator.task_timeout_ms = 120_000;
        config.teams = vec![Team::new(
            "review",
            vec![agent("r0", "a", 0).with_timeout(Duration::from_secs(600))],
        )];
        let orch = Orchestrator::new(context_with(&config, &[a]), &config);
        let token = CancellationToken::new();

        let (handle, mut rx) =
            orch.schedule_exhaustive(task(Duration::from_secs(10)), Duration::from_secs(300), token.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, ResultStatus::Failure);
        assert_eq!(first.failure_reason, Some(FailureReason::TaskTimeout));
        assert!(first.timing.elapsed_ms <= 10_000);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_exhaustive_delivers_each_period() {
        let a = ScriptedProvider::replying("a", "all clear");
        let b = ScriptedProvider::replying("b", "all clear");
        let orch = orchestrator(&[a.clone(), b.clone()]);
        let token = CancellationToken::new();

        let (handle, mut rx) =
            orch.schedule_exhaustive(task(Duration::from_secs(10)), Duration::from_secs(60), token.clone());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_ne!(first.task_id, second.task_id);
        assert_eq!(first.payload.as_deref(), Some("all clear"));
        assert_eq!(first.escalation_path, vec![crate::agents::Tier::Exhaustive]);
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 2);

        token.cancel();
        handle.await.unwrap();
    }
}
