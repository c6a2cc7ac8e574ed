//! Core Task type submitted to the swarm.
//!
//! # Invariants
//! - `payload` is non-empty
//! - A task is never mutated after construction; strategies only read it

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::provider::CallParams;
use crate::strategy::StrategyKind;

/// Deadline applied when the submitter does not pick one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within a process
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of work for a team of agents.
///
/// Built with [`Task::builder`]; all fields are private and read through
/// getters so a running strategy cannot change what it was asked to do.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    team: String,
    payload: String,
    required_capabilities: BTreeSet<String>,
    deadline: Instant,
    /// Span from build time to `deadline`
    timeout: Duration,
    strategy: Option<StrategyKind>,
    params: CallParams,
}

impl Task {
    /// Start building a task for `team`.
    pub fn builder(team: impl Into<String>, payload: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            id: None,
            team: team.into(),
            payload: payload.into(),
            required_capabilities: BTreeSet::new(),
            timeout: None,
            deadline: None,
            strategy: None,
            params: CallParams::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn required_capabilities(&self) -> &BTreeSet<String> {
        &self.required_capabilities
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time the task was given when it was built.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Explicit strategy override; `None` means "use the team default".
    pub fn strategy(&self) -> Option<StrategyKind> {
        self.strategy
    }

    pub fn params(&self) -> &CallParams {
        &self.params
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Copy of this task with a fresh id and a deadline one `timeout` from now,
    /// used for scheduled reruns.
    pub fn rerun(&self) -> Task {
        Task {
            id: TaskId::new(),
            deadline: Instant::now() + self.timeout,
            ..self.clone()
        }
    }
}

/// Builder for [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    id: Option<TaskId>,
    team: String,
    payload: String,
    required_capabilities: BTreeSet<String>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    strategy: Option<StrategyKind>,
    params: CallParams,
}

impl TaskBuilder {
    pub fn id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.required_capabilities.insert(tag.into());
        self
    }

    pub fn capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(tags.into_iter().map(Into::into));
        self
    }

    /// Deadline relative to the moment `build` is called.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute deadline; wins over `timeout`.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn maybe_strategy(mut self, strategy: Option<StrategyKind>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn params(mut self, params: CallParams) -> Self {
        self.params = params;
        self
    }

    /// Finish the task.
    ///
    /// # Errors
    /// Returns `Err` if the payload or team is empty, or the timeout is zero.
    pub fn build(self) -> Result<Task, TaskError> {
        if self.payload.trim().is_empty() {
            return Err(TaskError::EmptyPayload);
        }
        if self.team.trim().is_empty() {
            return Err(TaskError::EmptyTeam);
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(TaskError::ZeroTimeout);
        }

        let now = Instant::now();
        let (deadline, timeout) = match self.deadline {
            Some(deadline) => (deadline, deadline.saturating_duration_since(now)),
            None => {
                let timeout = self.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT);
                (now + timeout, timeout)
            }
        };

        Ok(Task {
            id: self.id.unwrap_or_default(),
            team: self.team,
            payload: self.payload,
            required_capabilities: self.required_capabilities,
            deadline,
            timeout,
            strategy: self.strategy,
            params: self.params,
        })
    }
}

/// Errors that can occur while building a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task payload cannot be empty")]
    EmptyPayload,

    #[error("Task must name a team")]
    EmptyTeam,

    #[error("Task timeout must be greater than zero")]
    ZeroTimeout,
}
