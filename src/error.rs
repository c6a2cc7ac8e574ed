//! Error taxonomy for agent invocations and orchestration.
//!
//! Invocation errors are values, not panics: the invoker always hands back a
//! typed [`InvocationError`] inside an `InvocationResult`, and the strategy
//! engine consults [`ErrorKind`] to decide whether a retry is worthwhile.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Error from a single agent invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationError {
    /// The remote call exceeded its timeout.
    #[error("provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    /// The capacity router (or the provider itself) refused the call.
    #[error("provider {provider} rate limited, retry after {retry_after_ms}ms")]
    ProviderRateLimited { provider: String, retry_after_ms: u64 },

    /// The provider rejected our credentials.
    #[error("provider {provider} rejected credentials: {message}")]
    ProviderAuthFailure { provider: String, message: String },

    /// Transport failure, 5xx, or a malformed response stream.
    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// The provider's circuit is open; no network attempt was made.
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// The task deadline passed before this call finished.
    #[error("task deadline exceeded")]
    TaskTimeout,

    /// The caller cancelled the task.
    #[error("task cancelled")]
    Cancelled,
}

impl InvocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            Self::ProviderRateLimited { .. } => ErrorKind::ProviderRateLimited,
            Self::ProviderAuthFailure { .. } => ErrorKind::ProviderAuthFailure,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::TaskTimeout => ErrorKind::TaskTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Check if the strategy engine may retry this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Provider-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ProviderRateLimited { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }

    /// Whether this error ended the call because the task scope was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::TaskTimeout | Self::Cancelled)
    }
}

/// Classification of invocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Call exceeded its timeout - transient, retry with backoff
    ProviderTimeout,
    /// Budget exhausted - transient, retry after the window frees up
    ProviderRateLimited,
    /// Bad or revoked credentials - permanent
    ProviderAuthFailure,
    /// Transport or server failure - transient
    ProviderUnavailable,
    /// Fast-failed by the circuit breaker - try another agent instead
    CircuitOpen,
    /// Deadline reached - terminal for the task
    TaskTimeout,
    /// Cancelled by the caller - terminal for the task
    Cancelled,
}

impl ErrorKind {
    /// Check if this error kind is transient (worth another attempt on the same agent).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderTimeout
                | ErrorKind::ProviderRateLimited
                | ErrorKind::ProviderUnavailable
        )
    }

    /// Check if this error should trigger agent substitution.
    pub fn should_substitute(&self) -> bool {
        matches!(self, ErrorKind::CircuitOpen)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ProviderTimeout => write!(f, "provider_timeout"),
            ErrorKind::ProviderRateLimited => write!(f, "provider_rate_limited"),
            ErrorKind::ProviderAuthFailure => write!(f, "provider_auth_failure"),
            ErrorKind::ProviderUnavailable => write!(f, "provider_unavailable"),
            ErrorKind::CircuitOpen => write!(f, "circuit_open"),
            ErrorKind::TaskTimeout => write!(f, "task_timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors surfaced by the orchestrator's task registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SwarmError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already submitted: {0}")]
    DuplicateTask(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ErrorKind::ProviderTimeout.is_retryable());
        assert!(ErrorKind::ProviderRateLimited.is_retryable());
        assert!(ErrorKind::ProviderUnavailable.is_retryable());
        assert!(!ErrorKind::ProviderAuthFailure.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::TaskTimeout.is_retryable());
        assert!(ErrorKind::CircuitOpen.should_substitute());
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let limited = InvocationError::ProviderRateLimited {
            provider: "openai".to_string(),
            retry_after_ms: 1500,
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(1500)));

        let timeout = InvocationError::ProviderTimeout {
            provider: "openai".to_string(),
            timeout_ms: 100,
        };
        assert_eq!(timeout.retry_after(), None);
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = InvocationError::CircuitOpen {
            provider: "anthropic".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "circuit_open");
        assert_eq!(json["provider"], "anthropic");
    }
}
