//! Agent invoker: one guarded remote call.
//!
//! Order of checks for every call:
//! 1. provider client lookup
//! 2. circuit breaker (fail fast when open)
//! 3. capacity permit (reject with `ProviderRateLimited`, never retried here)
//! 4. worker-pool slot
//! 5. remote call, bounded by the call timeout and the task scope
//!
//! The invoker never returns an `Err`; every outcome is an [`InvocationResult`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::agents::Agent;
use crate::capacity::Admission;
use crate::context::SwarmContext;
use crate::error::InvocationError;
use crate::provider::{collect_stream, estimate_tokens, CallParams, ProviderError};
use crate::task::TaskScope;

/// Successful payload of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutput {
    pub content: String,
    pub severity: Option<f64>,
}

/// Outcome of one agent invocation (possibly after engine retries).
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub role: String,
    pub provider_id: String,
    pub priority: u32,
    pub weight: f64,
    pub outcome: Result<InvocationOutput, InvocationError>,
    pub latency: Duration,
    pub token_cost: u64,
    pub attempts: u32,
}

impl InvocationResult {
    fn new(agent: &Agent, outcome: Result<InvocationOutput, InvocationError>, started: Instant) -> Self {
        Self {
            role: agent.role.clone(),
            provider_id: agent.provider_id.clone(),
            priority: agent.priority,
            weight: agent.weight,
            outcome,
            latency: started.elapsed(),
            token_cost: 0,
            attempts: 1,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn content(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|o| o.content.as_str())
    }

    pub fn error(&self) -> Option<&InvocationError> {
        self.outcome.as_ref().err()
    }
}

/// Map a provider-level error into the invocation taxonomy.
pub fn classify_provider_error(provider: &str, error: ProviderError, timeout: Duration) -> InvocationError {
    let provider = provider.to_string();
    match error {
        ProviderError::Auth(message) => InvocationError::ProviderAuthFailure { provider, message },
        ProviderError::Rejected { status, message } => InvocationError::ProviderAuthFailure {
            provider,
            message: format!("request rejected (HTTP {}): {}", status, message),
        },
        ProviderError::RateLimited { retry_after } => InvocationError::ProviderRateLimited {
            provider,
            retry_after_ms: retry_after.unwrap_or(Duration::from_secs(1)).as_millis() as u64,
        },
        ProviderError::Timeout => InvocationError::ProviderTimeout {
            provider,
            timeout_ms: timeout.as_millis() as u64,
        },
        e @ (ProviderError::Server { .. }
        | ProviderError::Transport(_)
        | ProviderError::InvalidResponse(_)) => InvocationError::ProviderUnavailable {
            provider,
            message: e.to_string(),
        },
    }
}

#[derive(Clone)]
pub struct AgentInvoker {
    ctx: Arc<SwarmContext>,
}

impl AgentInvoker {
    pub fn new(ctx: Arc<SwarmContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SwarmContext> {
        &self.ctx
    }

    /// Call `agent` once with `prompt`.
    pub async fn invoke(
        &self,
        agent: &Agent,
        prompt: &str,
        params: &CallParams,
        timeout: Duration,
        scope: &TaskScope,
    ) -> InvocationResult {
        let started = Instant::now();
        let provider = agent.provider_id.as_str();

        if scope.is_cancelled() {
            return InvocationResult::new(agent, Err(scope.cancellation_error()), started);
        }

        let Some(client) = self.ctx.providers.get(provider) else {
            tracing::warn!(provider = %provider, role = %agent.role, "No client registered for provider");
            return InvocationResult::new(
                agent,
                Err(InvocationError::ProviderUnavailable {
                    provider: provider.to_string(),
                    message: "no client registered".to_string(),
                }),
                started,
            );
        };

        let pass = match self.ctx.circuits.try_acquire(provider) {
            Ok(pass) => pass,
            Err(e) => {
                tracing::debug!(provider = %provider, role = %agent.role, "Circuit open, failing fast");
                return InvocationResult::new(agent, Err(e), started);
            }
        };

        let params = CallParams {
            model: agent.model.clone().or_else(|| params.model.clone()),
            ..params.clone()
        };
        let permit = match self.ctx.capacity.admit(provider, estimate_tokens(prompt, &params)) {
            Admission::Granted(permit) => permit,
            Admission::Rejected { retry_after, .. } => {
                // Nothing was sent; the pass is abandoned without an outcome.
                drop(pass);
                return InvocationResult::new(
                    agent,
                    Err(InvocationError::ProviderRateLimited {
                        provider: provider.to_string(),
                        retry_after_ms: retry_after.as_millis() as u64,
                    }),
                    started,
                );
            }
        };

        let _worker = tokio::select! {
            _ = scope.cancelled() => {
                return InvocationResult::new(agent, Err(scope.cancellation_error()), started);
            }
            worker = self.ctx.workers().clone().acquire_owned() => match worker {
                Ok(w) => w,
                Err(_) => {
                    return InvocationResult::new(
                        agent,
                        Err(InvocationError::ProviderUnavailable {
                            provider: provider.to_string(),
                            message: "worker pool closed".to_string(),
                        }),
                        started,
                    );
                }
            },
        };

        let call_started = Instant::now();
        let call = async {
            let rx = client.stream(prompt, &params, timeout).await;
            collect_stream(rx).await
        };
        let outcome = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            r = tokio::time::timeout(timeout, call) => Some(r),
        };
        let latency = call_started.elapsed();

        let mut result = match outcome {
            None => {
                // Cancelled: the pass and permit are released by drop, nothing counted.
                tracing::debug!(provider = %provider, role = %agent.role, "Call cancelled by task scope");
                InvocationResult::new(agent, Err(scope.cancellation_error()), started)
            }
            Some(Ok(Ok(response))) => {
                pass.record_success();
                permit.settle(response.token_cost);
                self.ctx.health.record(provider, true, latency);
                tracing::debug!(
                    provider = %provider,
                    role = %agent.role,
                    latency_ms = latency.as_millis() as u64,
                    tokens = response.token_cost,
                    "Agent call succeeded"
                );
                let mut r = InvocationResult::new(
                    agent,
                    Ok(InvocationOutput {
                        content: response.content,
                        severity: response.severity,
                    }),
                    started,
                );
                r.token_cost = response.token_cost;
                r
            }
            Some(Ok(Err(e))) => {
                if e.kind().counts_toward_circuit() {
                    pass.record_failure();
                } else {
                    drop(pass);
                }
                drop(permit);
                self.ctx.health.record(provider, false, latency);
                let error = classify_provider_error(provider, e, timeout);
                tracing::warn!(provider = %provider, role = %agent.role, error = %error, "Agent call failed");
                InvocationResult::new(agent, Err(error), started)
            }
            Some(Err(_elapsed)) => {
                pass.record_failure();
                drop(permit);
                self.ctx.health.record(provider, false, latency);
                tracing::warn!(
                    provider = %provider,
                    role = %agent.role,
                    timeout_ms = timeout.as_millis() as u64,
                    "Agent call timed out"
                );
                InvocationResult::new(
                    agent,
                    Err(InvocationError::ProviderTimeout {
                        provider: provider.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    started,
                )
            }
        };
        result.latency = started.elapsed();
        result
    }
}
