//! Shared runtime state for one swarm.
//!
//! A [`SwarmContext`] owns the capacity router, circuit breakers, health
//! controller, provider clients, event sink and worker pool. It is passed
//! explicitly to the invoker, strategy engine and orchestrator, so several
//! independent swarms can live in the same process.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capacity::{BudgetUtilization, CapacityRouter};
use crate::circuit::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::config::SwarmConfig;
use crate::events::EventSink;
use crate::health::{DegradationLevel, HealthController, HealthMetrics, HealthSignals};
use crate::provider::ProviderRegistry;

pub struct SwarmContext {
    pub capacity: CapacityRouter,
    pub circuits: CircuitBreakerRegistry,
    pub health: Arc<HealthController>,
    pub providers: ProviderRegistry,
    pub events: Arc<dyn EventSink>,
    workers: Arc<Semaphore>,
    worker_limit: usize,
    call_timeout: Duration,
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub level: DegradationLevel,
    pub metrics: HealthMetrics,
    pub circuits: Vec<CircuitSnapshot>,
    pub budgets: Vec<BudgetUtilization>,
    pub workers_available: usize,
    pub worker_limit: usize,
}

impl SwarmContext {
    /// Build a context from configuration. Budgets are installed for every
    /// configured provider; other providers get the default budget.
    pub fn new(config: &SwarmConfig, providers: ProviderRegistry, events: Arc<dyn EventSink>) -> Self {
        let capacity = CapacityRouter::new(
            config.capacity.window(),
            config.capacity.buckets,
            config.capacity.default_budget,
        );
        for (id, provider) in &config.providers {
            if let Some(budget) = provider.budget {
                capacity.update_budget(id, budget);
            }
        }

        let worker_limit = config.orchestrator.worker_pool_size.max(1);
        Self {
            capacity,
            circuits: CircuitBreakerRegistry::new(config.circuit.clone(), events.clone()),
            health: Arc::new(HealthController::new(config.health.clone(), events.clone())),
            providers,
            events,
            workers: Arc::new(Semaphore::new(worker_limit)),
            worker_limit,
            call_timeout: config.orchestrator.call_timeout(),
        }
    }

    pub fn workers(&self) -> &Arc<Semaphore> {
        &self.workers
    }

    /// Timeout for agents without their own.
    pub fn default_call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn level(&self) -> DegradationLevel {
        self.health.level()
    }

    /// Current inputs for the health controller.
    pub fn health_signals(&self) -> HealthSignals {
        HealthSignals {
            capacity_pressure: self.capacity.max_pressure(),
            open_circuit_ratio: self.circuits.open_ratio(&self.providers.ids()),
        }
    }

    /// Start the background health evaluator.
    pub fn spawn_health_evaluator(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        self.health.spawn(move || ctx.health_signals(), token)
    }

    /// Apply new per-provider budgets from `config` without losing window history.
    pub fn reload_budgets(&self, config: &SwarmConfig) {
        self.capacity.set_default_budget(config.capacity.default_budget);
        for id in self.providers.ids() {
            self.capacity.update_budget(&id, config.budget_for(&id));
        }
        for id in config.providers.keys() {
            if !self.providers.contains(id) {
                self.capacity.update_budget(id, config.budget_for(id));
            }
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            level: self.level(),
            metrics: self.health.metrics(),
            circuits: self.circuits.snapshot(),
            budgets: self.capacity.snapshot(),
            workers_available: self.workers.available_permits(),
            worker_limit: self.worker_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::ProviderBudget;
    use crate::events::NullEventSink;

    #[tokio::test]
    async fn test_reload_budgets_applies_new_limits() {
        let mut config = SwarmConfig::default();
        config.providers.insert(
            "openai".to_string(),
            crate::config::ProviderConfig {
                budget: Some(ProviderBudget {
                    requests_per_minute: 10,
                    tokens_per_minute: 1000,
                    max_concurrent: None,
                }),
                ..Default::default()
            },
        );
        let ctx = SwarmContext::new(&config, ProviderRegistry::new(), Arc::new(NullEventSink));
        assert_eq!(
            ctx.capacity.utilization("openai").budget.requests_per_minute,
            10
        );

        if let Some(p) = config.providers.get_mut("openai") {
            p.budget = Some(ProviderBudget {
                requests_per_minute: 99,
                tokens_per_minute: 1000,
                max_concurrent: Some(2),
            });
        }
        ctx.reload_budgets(&config);

        let usage = ctx.capacity.utilization("openai");
        assert_eq!(usage.budget.requests_per_minute, 99);
        assert_eq!(usage.budget.max_concurrent, Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_reports_worker_pool() {
        let ctx = SwarmContext::new(
            &SwarmConfig::default(),
            ProviderRegistry::new(),
            Arc::new(NullEventSink),
        );
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.level, DegradationLevel::Normal);
        assert_eq!(snapshot.worker_limit, 32);
        assert_eq!(snapshot.workers_available, 32);
    }
}
