//! Edge tunnel service daemon
//!
//! Runs the identity lifecycle manager, the local IPC channels and the DNS
//! resolver until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use et_core::config::{self, ServiceConfig, StateStore};
use et_core::LogLevel;
use et_service::engine::DetachedEngine;
use et_service::netconfig::StaticNetworkConfig;
use et_service::{logging, TunnelService};

#[derive(Parser)]
#[command(name = "et-service")]
#[command(about = "Edge tunnel service daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (overrides the persisted level)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_note) = load_service_config(args.config.as_ref())?;

    // Initialize logging
    let level = if args.foreground {
        LogLevel::Debug
    } else if let Some(level) = &args.log_level {
        LogLevel::parse(level)
    } else {
        StateStore::new(config.state_path())
            .load()
            .map(|state| LogLevel::parse(&state.log_level))
            .unwrap_or_default()
    };
    let log_control = logging::init(level, Some(config.log_file.as_path()))?;

    tracing::info!("edge tunnel service starting...");
    tracing::info!("{}", config_note);

    let netconfig = Arc::new(StaticNetworkConfig::new(
        config.fallback_resolvers.clone(),
        Vec::new(),
    ));
    let service = TunnelService::new(config, Arc::new(DetachedEngine), netconfig)
        .with_log_control(Arc::new(log_control))
        .start()
        .await
        .context("Failed to start the tunnel service")?;

    wait_for_signal().await;

    service.shutdown().await;
    Ok(())
}

/// Load the configuration, returning a line describing where it came from
fn load_service_config(path: Option<&PathBuf>) -> Result<(ServiceConfig, String)> {
    if let Some(config_path) = path {
        let config: ServiceConfig = config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?;
        return Ok((config, format!("Using configuration {:?}", config_path)));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(match config::load_config(&default_path) {
            Ok(config) => (config, format!("Using configuration {:?}", default_path)),
            Err(e) => (
                ServiceConfig::default(),
                format!("Failed to load config from {:?}: {}; using defaults", default_path, e),
            ),
        })
    } else {
        Ok((ServiceConfig::default(), "Using default configuration".to_string()))
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            if let Err(e) = result {
                tracing::warn!("failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
