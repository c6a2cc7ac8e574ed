//! Health & degradation controller.
//!
//! Keeps a rolling window of call outcomes per provider and turns the error
//! rate, capacity pressure and circuit states into a single system-wide
//! [`DegradationLevel`]. The level moves one step at a time, up only after the
//! target has stayed higher for `trigger_window` and down only after it has
//! stayed lower for `recovery_window`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, SwarmEvent};

/// System-wide degradation level, ordered from healthiest to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DegradationLevel {
    Normal = 0,
    Degraded = 1,
    Minimal = 2,
    Maintenance = 3,
}

impl DegradationLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Degraded,
            2 => Self::Minimal,
            _ => Self::Maintenance,
        }
    }

    fn step_up(self) -> Self {
        Self::from_u8((self as u8).saturating_add(1).min(3))
    }

    fn step_down(self) -> Self {
        Self::from_u8((self as u8).saturating_sub(1))
    }

    /// Whether multi-round strategies (debate, tiered escalation) may run.
    pub fn allows_multi_round(&self) -> bool {
        *self <= Self::Degraded
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Degraded => write!(f, "degraded"),
            Self::Minimal => write!(f, "minimal"),
            Self::Maintenance => write!(f, "maintenance"),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_min_samples() -> usize {
    10
}
fn default_degraded_error_rate() -> f64 {
    0.25
}
fn default_minimal_error_rate() -> f64 {
    0.5
}
fn default_maintenance_error_rate() -> f64 {
    0.8
}
fn default_pressure_threshold() -> f64 {
    0.9
}
fn default_trigger_window_secs() -> u64 {
    10
}
fn default_recovery_window_secs() -> u64 {
    30
}
fn default_evaluation_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Rolling window for error rate and latency
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Samples needed before an error rate counts
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_degraded_error_rate")]
    pub degraded_error_rate: f64,
    #[serde(default = "default_minimal_error_rate")]
    pub minimal_error_rate: f64,
    #[serde(default = "default_maintenance_error_rate")]
    pub maintenance_error_rate: f64,
    /// Capacity pressure at or above this forces at least `Degraded`
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,
    #[serde(default = "default_trigger_window_secs")]
    pub trigger_window_secs: u64,
    #[serde(default = "default_recovery_window_secs")]
    pub recovery_window_secs: u64,
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            min_samples: default_min_samples(),
            degraded_error_rate: default_degraded_error_rate(),
            minimal_error_rate: default_minimal_error_rate(),
            maintenance_error_rate: default_maintenance_error_rate(),
            pressure_threshold: default_pressure_threshold(),
            trigger_window_secs: default_trigger_window_secs(),
            recovery_window_secs: default_recovery_window_secs(),
            evaluation_interval_ms: default_evaluation_interval_ms(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), String> {
        let rates = [
            self.degraded_error_rate,
            self.minimal_error_rate,
            self.maintenance_error_rate,
        ];
        if rates.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err("health error-rate thresholds must be within [0, 1]".to_string());
        }
        if !(self.degraded_error_rate < self.minimal_error_rate
            && self.minimal_error_rate < self.maintenance_error_rate)
        {
            return Err("health error-rate thresholds must be strictly increasing".to_string());
        }
        if self.recovery_window_secs <= self.trigger_window_secs {
            return Err("health recovery window must be longer than the trigger window".to_string());
        }
        if self.evaluation_interval_ms == 0 {
            return Err("health evaluation interval must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Inputs from the other components, gathered by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSignals {
    /// Highest budget pressure across providers
    pub capacity_pressure: f64,
    /// Fraction of configured providers whose circuit is not closed
    pub open_circuit_ratio: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    latency: Duration,
}

#[derive(Debug, Default)]
struct Hysteresis {
    escalate_since: Option<Instant>,
    recover_since: Option<Instant>,
}

/// Rolling stats for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub samples: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub level: DegradationLevel,
    pub samples: usize,
    /// `None` until `min_samples` outcomes are in the window
    pub error_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub providers: Vec<ProviderHealth>,
}

pub struct HealthController {
    config: HealthConfig,
    level: AtomicU8,
    samples: Mutex<HashMap<String, VecDeque<Sample>>>,
    hysteresis: Mutex<Hysteresis>,
    events: Arc<dyn EventSink>,
}

impl HealthController {
    pub fn new(config: HealthConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            level: AtomicU8::new(DegradationLevel::Normal as u8),
            samples: Mutex::new(HashMap::new()),
            hysteresis: Mutex::new(Hysteresis::default()),
            events,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Record one call outcome.
    pub fn record(&self, provider: &str, ok: bool, latency: Duration) {
        let now = Instant::now();
        let window = self.window();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let queue = samples.entry(provider.to_string()).or_default();
        queue.push_back(Sample {
            at: now,
            ok,
            latency,
        });
        while queue.front().is_some_and(|s| s.at + window <= now) {
            queue.pop_front();
        }
    }

    fn prune(&self, now: Instant) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Sample>>> {
        let window = self.window();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        for queue in samples.values_mut() {
            while queue.front().is_some_and(|s| s.at + window <= now) {
                queue.pop_front();
            }
        }
        samples
    }

    pub fn metrics(&self) -> HealthMetrics {
        let samples = self.prune(Instant::now());

        let stats = |queue: &VecDeque<Sample>| {
            let n = queue.len();
            let errors = queue.iter().filter(|s| !s.ok).count();
            let latency: Duration = queue.iter().map(|s| s.latency).sum();
            (n, errors, latency)
        };

        let mut providers: Vec<ProviderHealth> = samples
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(provider, queue)| {
                let (n, errors, latency) = stats(queue);
                ProviderHealth {
                    provider: provider.clone(),
                    samples: n,
                    error_rate: errors as f64 / n as f64,
                    avg_latency_ms: latency.as_secs_f64() * 1000.0 / n as f64,
                }
            })
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        let (total, errors, latency) = samples.values().fold(
            (0usize, 0usize, Duration::ZERO),
            |(n, e, l), q| {
                let (qn, qe, ql) = stats(q);
                (n + qn, e + qe, l + ql)
            },
        );
        drop(samples);

        HealthMetrics {
            level: self.level(),
            samples: total,
            error_rate: (total >= self.config.min_samples && total > 0)
                .then(|| errors as f64 / total as f64),
            avg_latency_ms: (total > 0).then(|| latency.as_secs_f64() * 1000.0 / total as f64),
            providers,
        }
    }

    /// Level the current signals point at, before hysteresis.
    pub fn target_level(&self, error_rate: Option<f64>, signals: HealthSignals) -> DegradationLevel {
        let mut target = match error_rate {
            Some(r) if r >= self.config.maintenance_error_rate => DegradationLevel::Maintenance,
            Some(r) if r >= self.config.minimal_error_rate => DegradationLevel::Minimal,
            Some(r) if r >= self.config.degraded_error_rate => DegradationLevel::Degraded,
            _ => DegradationLevel::Normal,
        };
        if signals.capacity_pressure >= self.config.pressure_threshold {
            target = target.max(DegradationLevel::Degraded);
        }
        if signals.open_circuit_ratio > 0.5 {
            target = DegradationLevel::Maintenance;
        }
        target
    }

    /// Run one evaluation step; returns the (possibly new) level.
    pub fn evaluate(&self, signals: HealthSignals) -> DegradationLevel {
        let now = Instant::now();
        let metrics = self.metrics();
        let target = self.target_level(metrics.error_rate, signals);
        let current = self.level();

        let next = {
            let mut h = self.hysteresis.lock().unwrap_or_else(|e| e.into_inner());
            if target > current {
                h.recover_since = None;
                let since = *h.escalate_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_secs(self.config.trigger_window_secs) {
                    let next = current.step_up();
                    h.escalate_since = (target > next).then_some(now);
                    next
                } else {
                    current
                }
            } else if target < current {
                h.escalate_since = None;
                let since = *h.recover_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_secs(self.config.recovery_window_secs) {
                    let next = current.step_down();
                    h.recover_since = (target < next).then_some(now);
                    next
                } else {
                    current
                }
            } else {
                h.escalate_since = None;
                h.recover_since = None;
                current
            }
        };

        if next != current {
            self.level.store(next as u8, Ordering::Release);
            self.events.emit(SwarmEvent::DegradationLevelChanged {
                from: current,
                to: next,
                error_rate: metrics.error_rate.unwrap_or(0.0),
                at: Utc::now(),
            });
        }
        next
    }

    /// Evaluate every `evaluation_interval_ms` until `token` is cancelled.
    pub fn spawn<F>(self: &Arc<Self>, signals: F, token: CancellationToken) -> JoinHandle<()>
    where
        F: Fn() -> HealthSignals + Send + 'static,
    {
        let controller = Arc::clone(self);
        let period = Duration::from_millis(controller.config.evaluation_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Health evaluator stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        controller.evaluate(signals());
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn force_level(&self, level: DegradationLevel) {
        self.level.store(level as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastEventSink, NullEventSink};

    fn controller() -> HealthController {
        HealthController::new(HealthConfig::default(), Arc::new(NullEventSink))
    }

    fn record_many(c: &HealthController, ok: bool, n: usize) {
        for _ in 0..n {
            c.record("openai", ok, Duration::from_millis(100));
        }
    }

    #[test]
    fn test_target_level_thresholds() {
        let c = controller();
        let none = HealthSignals::default();
        assert_eq!(c.target_level(None, none), DegradationLevel::Normal);
        assert_eq!(c.target_level(Some(0.1), none), DegradationLevel::Normal);
        assert_eq!(c.target_level(Some(0.3), none), DegradationLevel::Degraded);
        assert_eq!(c.target_level(Some(0.6), none), DegradationLevel::Minimal);
        assert_eq!(c.target_level(Some(0.9), none), DegradationLevel::Maintenance);

        let pressured = HealthSignals {
            capacity_pressure: 0.95,
            open_circuit_ratio: 0.0,
        };
        assert_eq!(c.target_level(None, pressured), DegradationLevel::Degraded);

        let broken = HealthSignals {
            capacity_pressure: 0.0,
            open_circuit_ratio: 0.75,
        };
        assert_eq!(c.target_level(Some(0.0), broken), DegradationLevel::Maintenance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_needs_min_samples() {
        let c = controller();
        record_many(&c, false, 9);
        assert_eq!(c.metrics().error_rate, None);
        record_many(&c, false, 1);
        assert_eq!(c.metrics().error_rate, Some(1.0));
        assert_eq!(c.metrics().avg_latency_ms, Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degradation_is_monotonic_then_recovers_after_window() {
        let sink = Arc::new(BroadcastEventSink::new());
        let mut rx = sink.subscribe();
        let c = HealthController::new(HealthConfig::default(), sink);

        // 60% errors: target Minimal.
        let mut levels = Vec::new();
        for _ in 0..30 {
            record_many(&c, false, 3);
            record_many(&c, true, 2);
            levels.push(c.evaluate(HealthSignals::default()));
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(levels[0], DegradationLevel::Normal);
        assert!(levels.contains(&DegradationLevel::Degraded));
        assert_eq!(*levels.last().unwrap(), DegradationLevel::Minimal);

        // Sustained success: one step down per recovery window.
        let mut recovered = Vec::new();
        for _ in 0..70 {
            record_many(&c, true, 50);
            recovered.push(c.evaluate(HealthSignals::default()));
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(recovered.windows(2).all(|w| w[0] >= w[1]));
        assert!(recovered[..29]
            .iter()
            .all(|l| *l == DegradationLevel::Minimal));
        assert_eq!(recovered[30], DegradationLevel::Degraded);
        assert_eq!(*recovered.last().unwrap(), DegradationLevel::Normal);

        let mut changes = 0;
        while let Ok(SwarmEvent::DegradationLevelChanged { .. }) = rx.try_recv() {
            changes += 1;
        }
        assert_eq!(changes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_spike_does_not_escalate() {
        let c = controller();
        record_many(&c, false, 20);
        assert_eq!(c.evaluate(HealthSignals::default()), DegradationLevel::Normal);
        tokio::time::advance(Duration::from_secs(5)).await;
        record_many(&c, true, 500);
        assert_eq!(c.evaluate(HealthSignals::default()), DegradationLevel::Normal);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(c.evaluate(HealthSignals::default()), DegradationLevel::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_evaluator_stops_on_cancel() {
        let c = Arc::new(controller());
        let token = CancellationToken::new();
        let handle = c.spawn(
            || HealthSignals {
                capacity_pressure: 1.0,
                open_circuit_ratio: 0.0,
            },
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(c.level(), DegradationLevel::Degraded);

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(HealthConfig::default().validate().is_ok());
        let bad = HealthConfig {
            recovery_window_secs: 5,
            ..HealthConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
