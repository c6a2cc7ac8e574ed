//! Cancellation scope shared by every call made on behalf of one task.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::InvocationError;

/// Cancellation token plus deadline for a task.
///
/// The scope counts as cancelled once its token fires *or* its deadline
/// passes, so no timer task is needed to enforce the deadline.
#[derive(Debug, Clone)]
pub struct TaskScope {
    token: CancellationToken,
    deadline: Instant,
}

impl TaskScope {
    pub fn new(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    /// Scope sharing an existing token (used by the async task registry).
    pub fn with_token(token: CancellationToken, deadline: Instant) -> Self {
        Self { token, deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves when the token fires or the deadline passes.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    /// Error describing why this scope ended.
    ///
    /// A passed deadline wins over an explicit cancel.
    pub fn cancellation_error(&self) -> InvocationError {
        if Instant::now() >= self.deadline {
            InvocationError::TaskTimeout
        } else {
            InvocationError::Cancelled
        }
    }
}
