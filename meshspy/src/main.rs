//! MeshSpy daemon.
//!
//! Forwards serial lines from a mesh radio to the bus and records node
//! telemetry received from the bus in SQLite.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use meshspy::config::MeshSpyConfig;
use meshspy::device_info::query_device_info;
use meshspy::pipeline::{Pipeline, PipelineOptions};
use meshspy::serial::SerialDevice;
use meshspy::storage::SqliteStore;

/// Environment file read at startup when present.
const ENV_FILE: &str = ".env.runtime";

/// Serial mesh radio to pub/sub bridge with telemetry recording.
#[derive(Parser, Debug)]
#[command(name = "meshspy")]
#[command(about = "Bridges a serial mesh radio to a pub/sub bus and records node telemetry")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Serial port (overrides config and SERIAL_PORT).
    #[arg(long)]
    port: Option<String>,

    /// Broker address (overrides config and MQTT_BROKER).
    #[arg(long)]
    broker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_file = dotenvy::from_filename(ENV_FILE);

    // Load configuration
    let config_path = MeshSpyConfig::locate(args.config.as_deref());
    let mut config = match &config_path {
        Some(path) => MeshSpyConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => MeshSpyConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid environment override")?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(broker) = args.broker {
        config.bus.broker = broker;
    }
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    meshspy_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting meshspy");
    match &config_path {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => info!("No configuration file found, using defaults"),
    }
    if let Err(e) = env_file {
        warn!(file = ENV_FILE, error = %e, "Environment file not loaded");
    }

    if config.device_info.enabled {
        match query_device_info(&config.device_info, &config.serial.port).await {
            Ok(output) => info!("Device info:\n{}", output),
            Err(e) => warn!(error = %e, "Could not get device info"),
        }
    }

    // Connect to the bus
    let bus = meshspy_bus::connect(&config.bus)
        .await
        .with_context(|| format!("Failed to connect to bus at {}", config.bus.broker))?;
    let bus = Arc::new(bus);

    // Open the store
    let store = match SqliteStore::open(&config.storage.path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            let _ = bus.disconnect(config.bus.drain_timeout()).await;
            return Err(e).context("Failed to open telemetry store");
        }
    };

    let device = SerialDevice {
        port: config.serial.port.clone(),
        baud_rate: config.serial.baud_rate,
        debug: config.serial.debug,
    };

    let options = PipelineOptions {
        raw_topic: config.topics.raw.clone(),
        telemetry_topic: config.topics.telemetry.clone(),
        drain_timeout: config.bus.drain_timeout(),
        shutdown_grace: config.shutdown_grace(),
        reopen_interval: config.serial.reopen_interval(),
    };

    let pipeline = Pipeline::new(device, Arc::clone(&bus), Arc::clone(&store), options);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pipeline_task = tokio::spawn(pipeline.run(shutdown_rx));

    let mut finished = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut pipeline_task => {
            finished = Some(result);
        }
    }

    let result = match finished {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            pipeline_task.await
        }
    };

    store.close().await;

    match result.context("Pipeline task panicked")? {
        Ok(_) => {
            info!("meshspy stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pipeline failed");
            Err(e.into())
        }
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
