use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opentrail::config::Config;
use opentrail::metrics::{ConnectionStats, ServiceStats, StorageStats};
use opentrail::parser::{PipelineParser, TemplateParser};
use opentrail::server::http;
use opentrail::server::tcp::{TcpServer, TcpServerConfig};
use opentrail::service::{LogService, ServiceConfig};
use opentrail::state::AppState;
use opentrail::storage::{Storage, StorageConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic thread-local tracing so config loading can log. The
    // guard is dropped before phase 2 installs the global subscriber.
    let basic_tracing = tracing::subscriber::set_default(
        tracing_subscriber::fmt().with_env_filter("opentrail=info").finish(),
    );

    info!("Starting OpenTrail v{}", env!("CARGO_PKG_VERSION"));

    // A validation failure is fatal with a non-zero exit code.
    let config = Config::load().context("configuration validation failed")?;

    // Phase 2: the real subscriber, honoring --log-level with RUST_LOG on top.
    drop(basic_tracing);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("opentrail={},tower_http=warn", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(
        tcp_port = config.tcp_port,
        http_port = config.http_port,
        database = %config.database_path,
        retention_days = config.retention_days,
        auth = config.auth_enabled,
        "configuration loaded"
    );

    let (shutdown_tx, _) = watch::channel(false);

    let storage = Arc::new(
        Storage::open(
            StorageConfig::new(config.database_path.clone()),
            StorageStats::new(),
        )
        .context("storage initialization failed")?,
    );

    let template = TemplateParser::new(&config.log_format)
        .map_err(|e| anyhow::anyhow!("invalid log format template: {}", e))?;
    let parser = Arc::new(PipelineParser::new(template));

    let service = LogService::start(
        ServiceConfig::default(),
        parser,
        storage.clone(),
        ServiceStats::new(),
        shutdown_tx.subscribe(),
    );

    let connection_stats = ConnectionStats::new();
    let state = AppState::new(
        config.clone(),
        service.clone(),
        storage.clone(),
        connection_stats.clone(),
        shutdown_tx.clone(),
    );

    let retention_task = tokio::spawn(run_retention_loop(
        storage.clone(),
        config.retention_days,
        Duration::from_secs(config.cleanup_interval_hours * 3600),
        shutdown_tx.subscribe(),
    ));

    let tcp_server = TcpServer::bind(
        TcpServerConfig::new(config.tcp_port, config.max_connections),
        service.clone(),
        connection_stats.clone(),
    )
    .await
    .context("failed to bind TCP ingestion port")?;
    let tcp_task = tokio::spawn(tcp_server.run(shutdown_tx.subscribe()));

    let http_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .context("failed to bind HTTP port")?;
    info!(addr = %http_listener.local_addr()?, "HTTP server listening");
    let http_task = tokio::spawn(http::run(state, http_listener));

    info!("✓ OpenTrail is ready");

    shutdown_signal().await;
    info!("shutdown signal received");

    // Stop intake first, then drain the pipeline front-to-back.
    let _ = shutdown_tx.send(true);
    if tcp_task.await.is_err() {
        warn!("TCP server task panicked");
    }
    service.shutdown().await;

    let closing = storage.clone();
    match tokio::task::spawn_blocking(move || closing.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("storage close failed: {}", e),
        Err(_) => warn!("storage close task panicked"),
    }

    let _ = retention_task.await;
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server error during shutdown: {}", e),
        Err(_) => warn!("HTTP server task panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Periodic retention cleanup. Cleanup (delete + checkpoint + VACUUM) is
/// blocking work, so each run goes through a blocking task.
async fn run_retention_loop(
    storage: Arc<Storage>,
    retention_days: u32,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately: one cleanup pass at startup.
    interval.tick().await;

    loop {
        let run = storage.clone();
        match tokio::task::spawn_blocking(move || run.cleanup(retention_days)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("retention cleanup failed: {}", e),
            Err(_) => warn!("retention cleanup task panicked"),
        }

        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
