//! swarm-orchestrator - HTTP Server Entry Point
//!
//! Loads the swarm configuration, builds provider clients and starts the API.

use std::sync::Arc;

use swarm_orchestrator::{
    api,
    config::SwarmConfig,
    context::SwarmContext,
    events::{BroadcastEventSink, EventSink},
    orchestrator::Orchestrator,
    provider::{HttpProviderClient, ProviderRegistry},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarm_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = SwarmConfig::path_from_env();
    let config = SwarmConfig::from_env()?;
    info!(
        path = %config_path.display(),
        providers = config.providers.len(),
        teams = config.teams.len(),
        "Loaded configuration"
    );

    let mut registry = ProviderRegistry::new();
    for provider in config.http_providers()? {
        info!(provider = %provider.id, base_url = %provider.base_url, "Registering provider");
        registry.register(Arc::new(HttpProviderClient::new(provider)));
    }
    if registry.is_empty() {
        warn!("No provider has a base_url; every agent call will fail");
    }

    let events = Arc::new(BroadcastEventSink::new());
    let sink: Arc<dyn EventSink> = events.clone();
    let ctx = Arc::new(SwarmContext::new(&config, registry, sink));

    let shutdown = CancellationToken::new();
    let evaluator = ctx.spawn_health_evaluator(shutdown.clone());

    let state = Arc::new(api::AppState {
        orchestrator: Orchestrator::new(Arc::clone(&ctx), &config),
        events,
        config_path,
    });

    // Start HTTP server
    let result = api::serve(&config, state).await;

    shutdown.cancel();
    if let Err(e) = evaluator.await {
        warn!("Health evaluator ended abnormally: {}", e);
    }
    result
}
