//! atelier service binary
//!
//! Wires the registry, pipeline library, engine, store, and bus together
//! and serves the HTTP surface.

use anyhow::Context;
use atelier::builtin::register_builtin_agents;
use atelier::config::ServiceConfig;
use atelier::events::EventBus;
use atelier::http::{router, AppState};
use atelier::persist::PersistClient;
use atelier::pipeline::{PipelineEngine, PipelineLibrary};
use atelier::registry::AgentRegistry;
use atelier::store::ExecutionStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("atelier=info,tower_http=info")),
        )
        .init();

    let config = ServiceConfig::from_env().context("loading service configuration")?;

    let registry = Arc::new(AgentRegistry::new());
    match &config.collaborator_url {
        Some(url) => {
            register_builtin_agents(&registry, url).context("registering built-in agents")?;
            tracing::info!(agents = registry.len(), collaborator = %url, "registered built-in agents");
        }
        None => {
            tracing::warn!(
                "ATELIER_AGENT_SERVICE_URL not set; no agents registered, pipelines cannot initialize"
            );
        }
    }

    let library = Arc::new(PipelineLibrary::with_builtin_default());
    if let Some(dir) = &config.pipeline_dir {
        let loaded = library
            .load_dir(dir)
            .with_context(|| format!("loading pipeline documents from {}", dir.display()))?;
        tracing::info!(loaded, dir = %dir.display(), "loaded pipeline documents");
    }

    let bus = EventBus::with_history_cap(config.history_cap);
    let store = Arc::new(ExecutionStore::new().with_max_stream_events(config.max_stream_events));
    let mut engine = PipelineEngine::new(registry.clone(), store.clone(), bus.clone());
    if let Some(persist) = config.persist_config() {
        tracing::info!(endpoint = %persist.endpoint, "archiving completed executions");
        engine = engine.with_persist(Arc::new(PersistClient::new(persist, bus.clone())));
    }

    let state = AppState {
        registry,
        library,
        engine,
        store,
        bus,
    };

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(%address, "atelier service listening");
    axum::serve(listener, router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}
