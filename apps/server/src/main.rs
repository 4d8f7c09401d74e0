//! OnAir Server - standalone headless encoding tower.
//!
//! Boots the full pipeline (PCM ingress, encoder supervision, pump,
//! broadcaster), serves the HTTP surface and runs until SIGTERM/Ctrl+C.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use onair_core::{bootstrap_services, start_server};
use tokio::signal;

use crate::config::ServerConfig;

/// OnAir Server - PCM-to-MP3 encoding tower with gap-free HTTP broadcast.
#[derive(Parser, Debug)]
#[command(name = "onair-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ONAIR_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ONAIR_BIND_PORT")]
    port: Option<u16>,

    /// PCM ingress listen address (overrides config file).
    #[arg(long, env = "ONAIR_PCM_LISTEN_ADDR")]
    pcm_listen_addr: Option<String>,

    /// Run without an encoder child (OFFLINE_TEST mode).
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("OnAir Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(addr) = args.pcm_listen_addr {
        config.pcm_listen_addr = addr;
    }
    if args.offline {
        config.encoder_disabled = true;
    }

    let core_config = config.to_core_config();
    core_config
        .validate()
        .context("Configuration rejected")?;

    log::info!(
        "Configuration: bind_port={}, stream_path={}, pcm_listen_addr={}, encoder={}",
        core_config.bind_port,
        core_config.stream_path,
        core_config.pcm_listen_addr,
        if core_config.encoder.disabled {
            "disabled (offline test)".to_string()
        } else {
            core_config.encoder.argv[0].clone()
        }
    );

    // Bootstrap the pipeline: ingress, encoder, pump, broadcaster.
    let services = bootstrap_services(core_config)
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Pipeline started");

    // Spawn the HTTP server on the main runtime.
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: pump, broadcaster, encoder child, ingress.
    services.shutdown().await;

    // The server task only serves live sockets at this point.
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
