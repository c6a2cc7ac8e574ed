//! Retry policy: exponential backoff with jitter, bounded rate-limit waits.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::InvocationError;

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter() -> f64 {
    0.25
}
fn default_max_rate_limit_wait_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per agent, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Extra random delay as a fraction of the backoff, in `[0, 1]`
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Longest `retry_after` worth waiting for; longer hints end the retry loop
    #[serde(default = "default_max_rate_limit_wait_ms")]
    pub max_rate_limit_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_rate_limit_wait_ms: default_max_rate_limit_wait_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 && delay > 0 {
            let max_extra = (delay as f64 * jitter) as u64;
            if max_extra > 0 {
                rand::thread_rng().gen_range(0..=max_extra)
            } else {
                0
            }
        } else {
            0
        };
        Duration::from_millis(delay + extra)
    }

    /// How long to wait before retrying after `error` on attempt `attempt`,
    /// or `None` when the error should not be retried.
    pub fn delay_for(&self, error: &InvocationError, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return None;
        }
        match error.retry_after() {
            Some(wait) if wait > Duration::from_millis(self.max_rate_limit_wait_ms) => None,
            Some(wait) => Some(wait),
            None => Some(self.backoff(attempt)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = RetryPolicy::default();
        for _ in 0..100 {
            let d = p.backoff(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_delay_for_respects_classification_and_attempts() {
        let p = policy();
        let timeout = InvocationError::ProviderTimeout {
            provider: "p".to_string(),
            timeout_ms: 10,
        };
        assert_eq!(p.delay_for(&timeout, 1), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(&timeout, 3), None);

        let auth = InvocationError::ProviderAuthFailure {
            provider: "p".to_string(),
            message: "bad key".to_string(),
        };
        assert_eq!(p.delay_for(&auth, 1), None);
    }

    #[test]
    fn test_rate_limit_waits_are_bounded() {
        let p = policy();
        let short = InvocationError::ProviderRateLimited {
            provider: "p".to_string(),
            retry_after_ms: 1_500,
        };
        assert_eq!(p.delay_for(&short, 1), Some(Duration::from_millis(1_500)));

        let long = InvocationError::ProviderRateLimited {
            provider: "p".to_string(),
            retry_after_ms: 45_000,
        };
        assert_eq!(p.delay_for(&long, 1), None);
    }
}
