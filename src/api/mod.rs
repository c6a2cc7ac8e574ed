//! HTTP API for the swarm orchestrator.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check with the current degradation level
//! - `GET /api/status` - Circuits, budgets, worker pool and task counts
//! - `POST /api/tasks` - Run a task and wait for the result
//! - `POST /api/tasks/async` - Start a task in the background
//! - `GET /api/tasks/{id}` - Poll a background task (202 pending, 200 result)
//! - `DELETE /api/tasks/{id}` - Cancel a background task
//! - `POST /api/config/reload` - Re-read provider budgets from the config file
//! - `GET /api/events` - Stream circuit and degradation events via SSE

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
