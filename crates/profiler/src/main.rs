//! pprof-server - Profiling sessions for Go services in Kubernetes
//!
//! Discovers pods exposing `/debug/pprof`, opens `go tool pprof` web UI
//! sessions on demand and optionally captures snapshots on a cron schedule.

use anyhow::{Context, Result};
use pprof_server::{api, config::ServerConfig};
use profiler_lib::{
    capture::CaptureScheduler,
    discovery::{build_classifier, HostRegistry, KubeClusterApi, DEFAULT_PORT_NAME},
    observability::StructuredLogger,
    session::SessionManager,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pprof-server");

    // Load configuration
    let config = ServerConfig::load()?;
    info!(
        port = config.port,
        dest = %config.dest.display(),
        strategy = ?config.discovery_strategy,
        "Server configured"
    );

    // Discovery
    let cluster = KubeClusterApi::connect(config.kubeconfig.as_deref())
        .await
        .context("Failed to connect to the cluster API")?;
    let classifier = build_classifier(
        config.discovery_strategy,
        config.probe_timeout(),
        DEFAULT_PORT_NAME,
    )?;
    let registry = Arc::new(
        HostRegistry::new(Arc::new(cluster), classifier)
            .with_priority(config.priority_namespaces()),
    );

    let sessions = Arc::new(SessionManager::new(
        config.session_base_port()?,
        config.pprof_command()?,
    ));

    let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| "pprof-server".to_string());
    let logger = StructuredLogger::new(instance);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Scheduled captures
    let capture = config.capture_config()?;
    logger.log_startup(SERVER_VERSION, config.port, capture.is_some());
    let scheduler_handle = capture.map(|capture| {
        let scheduler = Arc::new(CaptureScheduler::new(
            registry.clone(),
            sessions.clone(),
            capture,
            logger.clone(),
        ));
        tokio::spawn(scheduler.run(shutdown_tx.subscribe()))
    });

    // HTTP API
    let state = Arc::new(api::AppState::new(registry, sessions, config.dest.clone())?);
    let mut api_shutdown = shutdown_tx.subscribe();
    let mut api_handle = tokio::spawn(api::serve(config.port, state, async move {
        let _ = api_shutdown.recv().await;
    }));

    // Wait for shutdown signal or an API server failure
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
            let _ = shutdown_tx.send(());
            api_handle.await??;
        }
        result = &mut api_handle => {
            logger.log_shutdown("API server stopped");
            let _ = shutdown_tx.send(());
            result??;
        }
    }

    if let Some(handle) = scheduler_handle {
        handle.await?;
    }
    info!("Shutdown complete");

    Ok(())
}
