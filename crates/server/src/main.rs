//! Parley server entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use parley_config::{load_settings, Settings};
use parley_orchestrator::{OrchestratorConfig, ProfileBackendFactory, SessionOrchestrator};
use parley_rag::{RetrievalEngine, VectorStore};
use parley_server::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env}.toml > config/default.toml > defaults
    let env = std::env::var("PARLEY_ENV").ok();
    let settings = load_settings(env.as_deref())?;

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = env.as_deref().unwrap_or("default"),
        "Starting parley server"
    );

    let metrics_handle = init_metrics();
    tracing::info!("Prometheus metrics at /metrics");

    let stores = parley_persistence::init(
        &settings.database_url,
        settings.encryption_key_bytes()?,
    )
    .await?;
    tracing::info!("Relational stores ready");

    let vector_store = Arc::new(VectorStore::connect(&settings.vector_store_url)?);
    let engine = Arc::new(RetrievalEngine::new(vector_store));
    tracing::info!(endpoint = %settings.vector_store_url, "Vector store client ready");

    let factory = Arc::new(ProfileBackendFactory::new(
        stores.profiles.clone(),
        Duration::from_secs(settings.llm_call_timeout_seconds),
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        stores.conversations.clone(),
        stores.personas.clone(),
        factory,
        engine.clone(),
        OrchestratorConfig {
            llm_timeout: Duration::from_secs(settings.llm_call_timeout_seconds),
            idle_eviction: Duration::from_secs(settings.session_idle_eviction_seconds),
            event_buffer: settings.event_bus_per_subscriber_buffer,
            max_history: settings.max_history_per_request,
        },
    ));
    let eviction_shutdown = orchestrator.start_eviction_task();

    let state = AppState {
        settings: Arc::new(settings.clone()),
        stores,
        engine,
        orchestrator: orchestrator.clone(),
        metrics: Some(metrics_handle),
    };
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop sweeping, then cancel in-flight turns; cancelled turns persist
    // nothing.
    let _ = eviction_shutdown.send(true);
    orchestrator.shutdown();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Initialize tracing with an env filter and optional JSON output.
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.filter.clone()));

    if settings.log.json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init();
    }
}

/// Install the Prometheus recorder.
fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("metrics recorder installs once at startup")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
