//! Task module - what callers submit and what they get back.
//!
//! - [`Task`]: immutable submission (payload, capabilities, deadline, strategy override)
//! - [`TaskScope`]: cancellation token + deadline shared by every call for a task
//! - [`SwarmResult`]: the unified `success | partial | failure` answer with its audit trail

mod result;
mod scope;
#[allow(clippy::module_inception)]
pub mod task;

pub use result::{AgentFailure, Contribution, FailureReason, ResultStatus, SwarmResult, Timing};
pub use scope::TaskScope;
pub use task::{Task, TaskBuilder, TaskError, TaskId, DEFAULT_TASK_TIMEOUT};
