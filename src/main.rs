//! meterwatch Binary Entry Point
//!
//! Runs the acquisition loop, the retention scheduler and the HTTP API.
//! Core functionality is provided by the `meterwatch` library crate.

use clap::Parser;
use meterwatch::{
    acquisition::Orchestrator,
    config::AppConfig,
    device::{DeviceReader, WebMiClient},
    metrics::MetricsCollector,
    retention::RetentionManager,
    server::{AppState, create_router},
    storage::{DeviceRegistry, StorageBuilder},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// meterwatch - power-meter telemetry acquisition
#[derive(Parser, Debug)]
#[command(name = "meterwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "METERWATCH_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "METERWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "METERWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "METERWATCH_DB_URL")]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meterwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    config.validate()?;

    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        db = %config.database.url,
        devices = config.devices.len(),
        "Configuration loaded"
    );

    let handles = StorageBuilder::new(&config.database.url)
        .max_connections(config.database.max_connections)
        .writer_config(config.writer.clone())
        .build()
        .await?;
    tracing::info!("Storage initialized");

    let sync = handles
        .devices
        .sync_from_config(&config.to_device_records())
        .await?;
    tracing::info!(
        added = sync.added,
        updated = sync.updated,
        deleted = sync.deleted,
        "Device registry synced"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry: Arc<dyn DeviceRegistry> = Arc::new(handles.devices.clone());
    let client = WebMiClient::new(config.acquisition.read_timeout)?;
    let reader = Arc::new(
        DeviceReader::new(Arc::new(client), registry.clone())
            .with_breaker_config(config.circuit_breaker.clone())
            .with_read_timeout(config.acquisition.read_timeout),
    );
    let metrics = Arc::new(
        MetricsCollector::new()
            .with_reader(reader.clone())
            .with_writer(handles.writer.clone()),
    );

    let orchestrator = Orchestrator::new(
        registry.clone(),
        reader,
        handles.writer.clone(),
        metrics.clone(),
        config.acquisition.clone(),
    );
    let acquisition_task = {
        let orchestrator = orchestrator.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(rx).await })
    };

    let retention = Arc::new(
        RetentionManager::new(
            Arc::new(handles.measurements.clone()),
            config.retention.clone(),
        )
        .with_shutdown(shutdown_rx.clone()),
    );
    let retention_task = retention.clone().spawn(shutdown_rx);

    let app = create_router(AppState {
        pool: handles.pool.clone(),
        registry,
        orchestrator,
        metrics,
        retention,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    tracing::info!("Waiting for acquisition and retention to stop...");
    if let Err(e) = acquisition_task.await {
        tracing::error!(error = %e, "Acquisition task failed");
    }
    if let Some(task) = retention_task
        && let Err(e) = task.await
    {
        tracing::error!(error = %e, "Retention task failed");
    }

    tracing::info!("Shutting down storage...");
    if let Err(e) = handles.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown storage");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then signal every loop to stop.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    let _ = shutdown.send(true);
}
