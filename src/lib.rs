//! # Swarm Orchestrator
//!
//! Dispatches tasks to teams of AI agents backed by rate-limited remote
//! model providers, and merges their answers into one result.
//!
//! This library provides:
//! - Per-provider capacity budgets with RAII permits
//! - Circuit breakers and swarm-wide degradation levels
//! - Four execution strategies plus a single-agent fallback
//! - An HTTP API with async task polling and an SSE event stream
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │          Orchestrator            │
//!        │  (teams, async task registry)    │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │         StrategyEngine           │
//!        │  (consensus, tiers, debate,      │
//!        │   quality gate, retries)         │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │          AgentInvoker            │
//!        │  circuit → capacity → worker →   │
//!        │  provider stream                 │
//!        └──────────────────────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Receive a task for a named team
//! 2. Pick the strategy, degraded to fit the current health level
//! 3. Invoke agents under the task's deadline and cancellation token
//! 4. Aggregate into a `success | partial | failure` result with an audit trail
//!
//! ## Modules
//! - `agents`: agents, teams and tiers
//! - `capacity`: sliding-window budgets per provider
//! - `circuit`: per-provider circuit breakers
//! - `health`: error-rate tracking and degradation levels
//! - `invoker`: one guarded provider call
//! - `strategy`: execution strategies and the retry loop
//! - `aggregate`: majority, weighted and final-answer aggregation
//! - `orchestrator`: the public entry point

pub mod agents;
pub mod aggregate;
pub mod api;
pub mod capacity;
pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod invoker;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod strategy;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::SwarmConfig;
pub use context::SwarmContext;
pub use error::{InvocationError, SwarmError};
pub use orchestrator::{Orchestrator, TaskPoll};
pub use strategy::StrategyKind;
pub use task::{SwarmResult, Task, TaskId};
