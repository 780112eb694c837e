//! Tower Server — standalone binary for Tower, a 24/7 single-station MP3
//! broadcaster.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tower_core::{bootstrap, start_server, AppState};

use crate::config::ServerConfig;

/// Tower Server - headless 24/7 MP3 broadcaster.
#[derive(Parser, Debug)]
#[command(name = "tower-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TOWER_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port for the HTTP surface (overrides config file).
    #[arg(short = 'p', long, env = "TOWER_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tower Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    log::info!(
        "Configuration: bind_port={}, pcm_ingest_port={}, encoder_enabled={}",
        config.bind_port,
        config.pcm_ingest_port,
        config.encoder_enabled
    );

    let bootstrap_config = config
        .to_bootstrap_config()
        .context("Failed to build bootstrap configuration")?;
    let tower = Arc::new(bootstrap(bootstrap_config));
    tower.start().context("Failed to start Tower")?;

    log::info!("Tower started; broadcasting from port {}", config.pcm_ingest_port);

    let app_state = AppState::builder().tower(Arc::clone(&tower)).build();
    let bind_addr = config.bind_addr();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, bind_addr).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on {}", bind_addr);

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    server_handle.abort();
    tower.stop();

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
