//! HTTP route handlers.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::SwarmConfig;
use crate::error::SwarmError;
use crate::events::BroadcastEventSink;
use crate::orchestrator::{Orchestrator, OrchestratorStatus, TaskPoll};
use crate::task::{SwarmResult, TaskId};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Source of the SSE event stream
    pub events: Arc<BroadcastEventSink>,
    /// File re-read by the reload endpoint
    pub config_path: PathBuf,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/async", post(submit_task_async))
        .route("/api/tasks/:id", get(poll_task).delete(cancel_task))
        .route("/api/config/reload", post(reload_config))
        .route("/api/events", get(stream_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: &SwarmConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        level: state.orchestrator.context().level(),
    })
}

/// Degradation level, circuits, budgets and task counts.
async fn status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status().await)
}

/// Run a task and wait for its result.
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SwarmResult>, (StatusCode, String)> {
    let task = req
        .into_task(state.orchestrator.task_timeout())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state.orchestrator.submit(task).await))
}

/// Start a task in the background.
async fn submit_task_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitAsyncResponse>), (StatusCode, String)> {
    let task = req
        .into_task(state.orchestrator.task_timeout())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let id = state
        .orchestrator
        .submit_async(task)
        .await
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitAsyncResponse {
            id,
            status: "pending",
        }),
    ))
}

/// Poll an asynchronous task: 202 while running, 200 with the result once.
async fn poll_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let id = TaskId::from(id);
    match state.orchestrator.poll(id).await {
        Ok(TaskPoll::Pending) => Ok((
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                id,
                status: "pending",
            }),
        )
            .into_response()),
        Ok(TaskPoll::Ready(result)) => Ok(Json(result).into_response()),
        Err(e @ SwarmError::TaskNotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// Cancel a running task.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<CancelResponse> {
    let id = TaskId::from(id);
    let cancelled = state.orchestrator.cancel(id).await;
    Json(CancelResponse { id, cancelled })
}

/// Re-read the config file and apply its provider budgets.
async fn reload_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadResponse>, (StatusCode, String)> {
    let path = state.config_path.clone();
    let config = tokio::task::spawn_blocking(move || SwarmConfig::load(&path))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            tracing::warn!(error = %e, "Config reload failed");
            (StatusCode::BAD_REQUEST, e.to_string())
        })?;
    state.orchestrator.reload_budgets(&config);
    Ok(Json(ReloadResponse {
        providers: config.providers.len(),
    }))
}

/// Stream circuit and degradation events via SSE.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let name = match &ev {
                        crate::events::SwarmEvent::CircuitStateChanged { .. } => "circuit",
                        crate::events::SwarmEvent::DegradationLevelChanged { .. } => "degradation",
                    };
                    match Event::default().event(name).json_data(&ev) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(format!("{} events dropped", skipped)));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
