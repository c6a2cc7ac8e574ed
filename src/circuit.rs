//! Per-provider circuit breakers.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(recovery_timeout elapsed, next caller)---> HalfOpen (one probe)
//! HalfOpen --probe ok--> Closed      HalfOpen --probe failed--> Open
//! ```
//!
//! Callers take a [`CircuitPass`] before a remote call and settle it with the
//! outcome. A pass dropped without an outcome (the call was cancelled) frees
//! the probe slot without counting a failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::InvocationError;
use crate::events::{EventSink, SwarmEvent};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// One probe request is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before letting a probe through
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl CircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            total_failures: 0,
            total_successes: 0,
            times_opened: 0,
        }
    }
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    consecutive_failures: u32,
}

struct BreakerCell {
    provider: String,
    config: CircuitConfig,
    state: Mutex<BreakerState>,
    events: Arc<dyn EventSink>,
}

impl BreakerCell {
    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(state: &mut BreakerState, to: CircuitState) -> Transition {
        let from = state.state;
        state.state = to;
        if to == CircuitState::Open {
            state.opened_at = Some(Instant::now());
            state.times_opened += 1;
        }
        Transition {
            from,
            to,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Emit after the state lock is released.
    fn publish(&self, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };
        if t.to == CircuitState::Open {
            tracing::warn!(
                provider = %self.provider,
                from = %t.from,
                consecutive_failures = t.consecutive_failures,
                "Circuit opened"
            );
        } else {
            tracing::info!(provider = %self.provider, from = %t.from, to = %t.to, "Circuit transition");
        }
        self.events.emit(SwarmEvent::CircuitStateChanged {
            provider: self.provider.clone(),
            from: t.from,
            to: t.to,
            consecutive_failures: t.consecutive_failures,
            at: Utc::now(),
        });
    }

    fn settle(&self, probe: bool, success: bool) {
        let transition = {
            let mut state = self.lock();
            if success {
                state.total_successes += 1;
            } else {
                state.total_failures += 1;
            }

            if probe {
                state.probe_in_flight = false;
                if success {
                    state.consecutive_failures = 0;
                    Some(Self::transition(&mut state, CircuitState::Closed))
                } else {
                    state.consecutive_failures += 1;
                    Some(Self::transition(&mut state, CircuitState::Open))
                }
            } else if state.state != CircuitState::Closed {
                // Stragglers from before the trip do not move an open circuit.
                None
            } else if success {
                state.consecutive_failures = 0;
                None
            } else {
                state.consecutive_failures += 1;
                (state.consecutive_failures >= self.config.failure_threshold)
                    .then(|| Self::transition(&mut state, CircuitState::Open))
            }
        };
        self.publish(transition);
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }
}

/// Permission to make one call through a provider's circuit.
#[must_use = "settle the pass with record_success or record_failure"]
pub struct CircuitPass {
    cell: Arc<BreakerCell>,
    probe: bool,
    settled: bool,
}

impl CircuitPass {
    /// Whether this pass is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.cell.settle(self.probe, true);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.cell.settle(self.probe, false);
    }
}

impl Drop for CircuitPass {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.cell.release_probe();
        }
    }
}

/// Serializable view of one provider's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    /// Seconds until an open circuit admits a probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reopens_in_secs: Option<f64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
}

/// Circuit breakers for every provider, created lazily.
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    events: Arc<dyn EventSink>,
    cells: RwLock<HashMap<String, Arc<BreakerCell>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            events,
            cells: RwLock::new(HashMap::new()),
        }
    }

    fn cell(&self, provider: &str) -> Arc<BreakerCell> {
        if let Some(cell) = self
            .cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
        {
            return cell.clone();
        }
        self.cells
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(BreakerCell {
                    provider: provider.to_string(),
                    config: self.config.clone(),
                    state: Mutex::new(BreakerState::new()),
                    events: self.events.clone(),
                })
            })
            .clone()
    }

    /// Ask to make a call. Fails fast with `CircuitOpen` when the circuit is
    /// open, or half-open with its probe already taken.
    pub fn try_acquire(&self, provider: &str) -> Result<CircuitPass, InvocationError> {
        let cell = self.cell(provider);
        let (probe, transition) = {
            let mut state = cell.lock();
            match state.state {
                CircuitState::Closed => (false, None),
                CircuitState::Open => {
                    let elapsed = state
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed < self.config.recovery_timeout() || state.probe_in_flight {
                        return Err(InvocationError::CircuitOpen {
                            provider: provider.to_string(),
                        });
                    }
                    state.probe_in_flight = true;
                    (true, Some(BreakerCell::transition(&mut state, CircuitState::HalfOpen)))
                }
                CircuitState::HalfOpen => {
                    if state.probe_in_flight {
                        return Err(InvocationError::CircuitOpen {
                            provider: provider.to_string(),
                        });
                    }
                    // A cancelled probe left the slot free.
                    state.probe_in_flight = true;
                    (true, None)
                }
            }
        };
        cell.publish(transition);

        Ok(CircuitPass {
            cell,
            probe,
            settled: false,
        })
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.cell(provider).lock().state
    }

    /// Whether a call to `provider` would currently be let through.
    pub fn is_available(&self, provider: &str) -> bool {
        let cell = self.cell(provider);
        let state = cell.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !state.probe_in_flight,
            CircuitState::Open => {
                !state.probe_in_flight
                    && state
                        .opened_at
                        .map(|at| at.elapsed() >= self.config.recovery_timeout())
                        .unwrap_or(true)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let cells: Vec<Arc<BreakerCell>> = self
            .cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<CircuitSnapshot> = cells
            .iter()
            .map(|cell| {
                let state = cell.lock();
                let reopens_in_secs = match (state.state, state.opened_at) {
                    (CircuitState::Open, Some(at)) => Some(
                        self.config
                            .recovery_timeout()
                            .saturating_sub(at.elapsed())
                            .as_secs_f64(),
                    ),
                    _ => None,
                };
                CircuitSnapshot {
                    provider: cell.provider.clone(),
                    state: state.state,
                    consecutive_failures: state.consecutive_failures,
                    probe_in_flight: state.probe_in_flight,
                    reopens_in_secs,
                    total_successes: state.total_successes,
                    total_failures: state.total_failures,
                    times_opened: state.times_opened,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// Fraction of `providers` whose circuit is not closed.
    pub fn open_ratio(&self, providers: &[String]) -> f64 {
        if providers.is_empty() {
            return 0.0;
        }
        let open = providers
            .iter()
            .filter(|p| self.state(p) != CircuitState::Closed)
            .count();
        open as f64 / providers.len() as f64
    }
}
