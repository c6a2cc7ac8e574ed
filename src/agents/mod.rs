//! Agents module - the configured roles a swarm can dispatch to.
//!
//! # Key Concepts
//! - **Agent**: a role bound to a provider, with capabilities, priority and weight
//! - **Team**: an ordered set of agents plus strategy settings (tiers, debate, quality gate)
//! - **TeamRegistry**: read-only lookup of teams by name
//!
//! Agents and teams are loaded once from configuration and never mutated
//! by a task, so they are shared without locking.

mod team;
mod types;

pub use team::{DebateConfig, QualityConfig, Team, TeamRegistry, Tier, TierConfig};
pub use types::{Agent, ResponseStyle};
