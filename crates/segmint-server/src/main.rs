//! segmint-server binary entry point.
//!
//! Wires the segment store, node registry, issuance engine, and background
//! loops (heartbeat, failover scan) together and serves the HTTP API until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use segmint::{
    spawn_heartbeat, FailoverController, IssuanceEngine, MemoryStore, NodeRegistry, SegmentStore,
    SystemClock,
};
use segmint_pg::PgStore;
use segmint_server::server;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use server::config::{CliArgs, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let store: Arc<dyn SegmentStore> = if config.memory_store {
        tracing::warn!(
            "running on the in-memory store; segments are neither durable nor shared with a peer"
        );
        Arc::new(MemoryStore::new())
    } else {
        let url = config
            .database_url
            .as_deref()
            .context("database url missing after validation")?;
        let store = PgStore::connect(url)
            .await
            .context("failed to connect to the segment store")?;
        store
            .ensure_schema()
            .await
            .context("failed to ensure the segment schema")?;
        Arc::new(store)
    };

    let registry = Arc::new(NodeRegistry::new(
        config.node_id.clone(),
        config.role,
        Arc::clone(&store),
    ));
    registry.register().await.context("node registration failed")?;

    let engine = Arc::new(IssuanceEngine::new(
        store,
        Arc::clone(&registry),
        Arc::new(SystemClock),
        config.engine.clone(),
    ));
    spawn_heartbeat(Arc::clone(&registry), config.engine.heartbeat_interval);
    FailoverController::spawn(Arc::clone(&engine), config.engine.failover_scan_interval);

    let app = server::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        role = %config.role,
        node_id = %config.node_id,
        "id issuance service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flip our registry row Offline so the peer takes over promptly instead
    // of waiting out the stale-heartbeat threshold.
    if let Err(err) = registry.deregister().await {
        tracing::warn!(error = %err, "failed to mark node offline during shutdown");
    }
    tracing::info!("shut down gracefully");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
