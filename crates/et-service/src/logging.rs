//! Log subscriber setup
//!
//! Logs go to stdout and, without ANSI colours, to the service log file that
//! the log channel streams back to clients. The level filter sits behind a
//! reload layer so the `SetLogLevel` command can change it at runtime.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use et_core::LogLevel;

use crate::state::LogLevelControl;

/// Handle to the process-wide level filter
pub struct ReloadLogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelControl for ReloadLogLevel {
    fn apply(&self, level: LogLevel) -> Result<(), String> {
        self.handle
            .reload(EnvFilter::new(level.filter_directive()))
            .map_err(|e| format!("could not change log level: {}", e))
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, overrides the initial level.
pub fn init(level: LogLevel, log_file: Option<&Path>) -> Result<ReloadLogLevel> {
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| level.filter_directive().into()),
    );
    let (filter, handle) = reload::Layer::new(filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(ReloadLogLevel { handle })
}
