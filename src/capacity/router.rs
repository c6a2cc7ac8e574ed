//! Per-provider admission control.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::window::SlidingWindow;

/// Wait hint returned when a provider is at its concurrency cap.
pub const CONCURRENCY_RETRY_HINT: Duration = Duration::from_millis(100);

/// Budget for one provider, counted over the router's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBudget {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

impl Default for ProviderBudget {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            max_concurrent: None,
        }
    }
}

/// Which ceiling caused a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Requests,
    Tokens,
    Concurrency,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Requests => write!(f, "requests"),
            RejectReason::Tokens => write!(f, "tokens"),
            RejectReason::Concurrency => write!(f, "concurrency"),
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Granted(Permit),
    Rejected {
        retry_after: Duration,
        reason: RejectReason,
    },
}

#[derive(Debug)]
struct SlotState {
    budget: ProviderBudget,
    window: SlidingWindow,
    in_flight: u32,
    admitted_total: u64,
    rejected_total: u64,
    released_total: u64,
}

#[derive(Debug)]
struct ProviderSlot {
    state: Mutex<SlotState>,
}

impl ProviderSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Admission ticket for one call.
///
/// Holds one in-flight slot until dropped. Dropping releases the slot exactly
/// once whether the call succeeded, failed, or was cancelled.
#[derive(Debug)]
pub struct Permit {
    provider: String,
    slot: Arc<ProviderSlot>,
    bucket_start: Instant,
    estimated_tokens: u64,
}

impl Permit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    /// Replace the admission estimate with the tokens actually used, then release.
    pub fn settle(self, actual_tokens: u64) {
        self.slot
            .lock()
            .window
            .adjust_tokens(self.bucket_start, self.estimated_tokens, actual_tokens);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.released_total += 1;
    }
}

/// Point-in-time usage of one provider budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetUtilization {
    pub provider: String,
    pub budget: ProviderBudget,
    pub requests_used: u64,
    pub tokens_used: u64,
    pub in_flight: u32,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub released_total: u64,
}

impl BudgetUtilization {
    /// Highest fill ratio among the request, token and concurrency ceilings.
    pub fn pressure(&self) -> f64 {
        let ratio = |used: u64, limit: u64| {
            if limit == 0 {
                1.0
            } else {
                used as f64 / limit as f64
            }
        };
        let mut pressure = ratio(self.requests_used, self.budget.requests_per_minute)
            .max(ratio(self.tokens_used, self.budget.tokens_per_minute));
        if let Some(max) = self.budget.max_concurrent {
            pressure = pressure.max(ratio(self.in_flight as u64, max as u64));
        }
        pressure
    }
}

/// Tracks consumption per provider and admits or rejects calls.
///
/// Admission and recording happen under one per-provider lock, so concurrent
/// callers can never overshoot a budget. Providers without an explicit budget
/// get `default_budget` on first use.
#[derive(Debug)]
pub struct CapacityRouter {
    window_span: Duration,
    buckets: u32,
    default_budget: RwLock<ProviderBudget>,
    slots: RwLock<HashMap<String, Arc<ProviderSlot>>>,
}

impl CapacityRouter {
    pub fn new(window_span: Duration, buckets: u32, default_budget: ProviderBudget) -> Self {
        Self {
            window_span,
            buckets,
            default_budget: RwLock::new(default_budget),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Router with a 60 s window split into 60 buckets.
    pub fn with_default_window(default_budget: ProviderBudget) -> Self {
        Self::new(Duration::from_secs(60), 60, default_budget)
    }

    fn slot(&self, provider: &str) -> Arc<ProviderSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
        {
            return slot.clone();
        }

        let budget = *self.default_budget.read().unwrap_or_else(|e| e.into_inner());
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderSlot {
                    state: Mutex::new(SlotState {
                        budget,
                        window: SlidingWindow::new(self.window_span, self.buckets),
                        in_flight: 0,
                        admitted_total: 0,
                        rejected_total: 0,
                        released_total: 0,
                    }),
                })
            })
            .clone()
    }

    /// Set (or hot-reload) a provider's budget. Window history is kept.
    pub fn update_budget(&self, provider: &str, budget: ProviderBudget) {
        let slot = self.slot(provider);
        let mut state = slot.lock();
        if state.budget != budget {
            tracing::info!(
                provider = %provider,
                requests_per_minute = budget.requests_per_minute,
                tokens_per_minute = budget.tokens_per_minute,
                "Provider budget updated"
            );
        }
        state.budget = budget;
    }

    /// Change the budget used for providers seen for the first time.
    pub fn set_default_budget(&self, budget: ProviderBudget) {
        *self.default_budget.write().unwrap_or_else(|e| e.into_inner()) = budget;
    }

    /// Try to admit one call estimated at `estimated_tokens`.
    ///
    /// An estimate larger than the whole token budget is clamped to it, so an
    /// oversized request can still run once the window is empty.
    pub fn admit(&self, provider: &str, estimated_tokens: u64) -> Admission {
        let slot = self.slot(provider);
        let now = Instant::now();
        let mut state = slot.lock();

        let budget = state.budget;
        let cost = estimated_tokens.min(budget.tokens_per_minute);
        let (requests, tokens) = state.window.totals(now);

        let rejection = if budget.max_concurrent.is_some_and(|max| state.in_flight >= max) {
            Some((CONCURRENCY_RETRY_HINT, RejectReason::Concurrency))
        } else if requests + 1 > budget.requests_per_minute {
            Some((state.window.retry_after(now), RejectReason::Requests))
        } else if tokens.saturating_add(cost) > budget.tokens_per_minute {
            Some((state.window.retry_after(now), RejectReason::Tokens))
        } else {
            None
        };

        if let Some((retry_after, reason)) = rejection {
            state.rejected_total += 1;
            tracing::debug!(
                provider = %provider,
                reason = %reason,
                retry_after_ms = retry_after.as_millis() as u64,
                "Capacity rejected call"
            );
            return Admission::Rejected {
                // A zero-request budget has nothing to wait for; use the whole window.
                retry_after: if retry_after.is_zero() {
                    self.window_span
                } else {
                    retry_after
                },
                reason,
            };
        }

        let bucket_start = state.window.record(now, cost);
        state.in_flight += 1;
        state.admitted_total += 1;
        drop(state);

        Admission::Granted(Permit {
            provider: provider.to_string(),
            slot,
            bucket_start,
            estimated_tokens: cost,
        })
    }

    pub fn utilization(&self, provider: &str) -> BudgetUtilization {
        let slot = self.slot(provider);
        let now = Instant::now();
        let mut state = slot.lock();
        let (requests_used, tokens_used) = state.window.totals(now);
        BudgetUtilization {
            provider: provider.to_string(),
            budget: state.budget,
            requests_used,
            tokens_used,
            in_flight: state.in_flight,
            admitted_total: state.admitted_total,
            rejected_total: state.rejected_total,
            released_total: state.released_total,
        }
    }

    /// Utilization of every provider seen so far, sorted by provider id.
    pub fn snapshot(&self) -> Vec<BudgetUtilization> {
        let mut providers: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        providers.sort();
        providers.iter().map(|p| self.utilization(p)).collect()
    }

    /// Highest pressure across all providers (0.0 when none are known).
    pub fn max_pressure(&self) -> f64 {
        self.snapshot()
            .iter()
            .map(BudgetUtilization::pressure)
            .fold(0.0, f64::max)
    }
}
