//! SuperDash Server - headless playout-state aggregator.
//!
//! Connects to the configured device fleet, aggregates transport state and
//! serves it to dashboard WebSocket clients, Ember+ consumers and TSL UMD
//! tally displays. Runs until SIGINT/SIGTERM, then shuts down in
//! dependency order.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use superdash_core::{bootstrap, start_server, validate_servers};
use tokio::signal;

use crate::config::ConfigFile;

/// SuperDash Server - broadcast playout device aggregation.
#[derive(Parser, Debug)]
#[command(name = "superdash-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (JSON).
    #[arg(short, long, value_name = "FILE", default_value = "config.json", env = "SUPERDASH_CONFIG")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SUPERDASH_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// WebSocket port (overrides config file).
    #[arg(short = 'p', long, env = "SUPERDASH_WEBSOCKET_PORT")]
    web_socket_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("SuperDash Server v{}", env!("CARGO_PKG_VERSION"));

    // Config problems are fatal: load, schema and semantic validation all
    // exit non-zero through the error return.
    let mut config = ConfigFile::load(&args.config).context("Failed to load configuration")?;
    if let Some(port) = args.web_socket_port {
        config.settings.web_socket_port = port;
    }
    validate_servers(&config.servers).context("Invalid device configuration")?;

    log::info!(
        "Configuration: {} device(s), webSocketPort={}, emberPlusPort={}, {} TSL destination(s)",
        config.servers.len(),
        config.settings.web_socket_port,
        config.settings.ember_plus_port,
        config.settings.tsl_umd_destinations.len(),
    );

    let services = bootstrap(config.settings, config.servers)
        .await
        .context("Failed to bootstrap services")?;

    // Serve WebSocket + HTTP on the main runtime.
    let app_state = services.app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {e}");
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    // Clients first, then outputs, then the WebSocket server.
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
