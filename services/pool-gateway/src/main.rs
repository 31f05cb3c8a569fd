//! Pool Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the account snapshot and logs the pool in
//! 2. Listens for chat and account-management requests
//! 3. Routes each chat request across the pool with failover and cooldowns
//! 4. Persists pool state periodically and once more on shutdown

mod api;
mod config;
mod error;
mod metrics;
mod router;

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{Pool, SessionManager, SnapshotStore, spawn_flush_task, spawn_monitor_task};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{ChatApi, HttpChatApi};

use crate::api::AppState;
use crate::config::Config;
use crate::router::ProxyRouter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting pool-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.base_url,
        snapshot_path = %config.pool.snapshot_path.display(),
        retry_budget = config.pool.retry_budget,
        "configuration loaded"
    );

    // Upstream HTTP client: connect timeout plus idle read timeout between
    // stream chunks. No total request deadline; a healthy chat stream may
    // outlive any fixed value.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.upstream.request_timeout_secs))
        .build()
        .context("failed to build upstream HTTP client")?;

    let store = Arc::new(SnapshotStore::new(&config.pool.snapshot_path));
    let records = match store.load().await {
        Ok(records) => records,
        Err(account_pool::Error::CorruptSnapshot(detail)) => {
            warn!(
                path = %store.path().display(),
                error = %detail,
                "snapshot unreadable, starting with an empty pool"
            );
            Vec::new()
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to load snapshot from {}", store.path().display())
            });
        }
    };
    info!(accounts = records.len(), "snapshot loaded");

    let pool = Arc::new(Pool::with_accounts(config.pool_settings(), records));
    let api = Arc::new(HttpChatApi::new(client, config.upstream.base_url.clone()));
    let manager = SessionManager::new(
        Arc::clone(&pool),
        api as Arc<dyn ChatApi>,
        config.register.email_domain.clone(),
    );

    // Boot login pass, then the monitor owns the probe schedule
    let activated = manager.login_all(config.monitor.probe_concurrency).await;
    info!(activated, "startup login pass complete");

    let monitor_handle = spawn_monitor_task(
        manager.clone(),
        config.probe_interval(),
        config.monitor.probe_concurrency,
    );
    let flush_handle = spawn_flush_task(
        Arc::clone(&pool),
        Arc::clone(&store),
        config.flush_interval(),
    );

    let app_state = AppState {
        router: Arc::new(ProxyRouter::new(manager.clone(), config.pool.retry_budget)),
        manager,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
        default_model: config.register.default_model.clone(),
        register_concurrency: config.register.default_concurrency,
        probe_concurrency: config.monitor.probe_concurrency,
    };

    let app = api::build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. The drain timeout starts at signal receipt, so a slow client cannot
    //    block process exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(config.drain_timeout(), server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = pool.in_flight_total();
            warn!(
                remaining,
                drain_timeout_secs = config.drain_timeout().as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    monitor_handle.abort();
    flush_handle.abort();

    // One final snapshot so a restart resumes from current pool state
    if let Err(err) = account_pool::flush(&pool, &store).await {
        warn!(error = %err, "final snapshot flush failed");
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
