//! Logging initialization.
//!
//! Logs go to stderr by default or to an append-mode file. `RUST_LOG`
//! takes precedence over the configured level.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Build the filter: `RUST_LOG` if set and valid, otherwise `level`.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber.
pub fn init(log_file: Option<&Path>, level: &str, format: LogFormat) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter(level));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let writer = Mutex::new(file);

            match format {
                LogFormat::Text => registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .try_init(),
                LogFormat::Json => registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .try_init(),
            }
        }
        None => match format {
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        },
    }
    .context("logging already initialized")
}
