//! Logging initialization for go2jail.
//!
//! Configures `tracing-subscriber` from the shared `--log-*` flags.
//! Supports JSON structured logging and human-readable pretty format,
//! writing to stderr, stdout, or an append-only file.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::LogArgs;

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
/// `RUST_LOG` takes precedence over `--log-level` when set.
pub fn init_tracing(log: &LogArgs) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.log_level));

    let writer = match log.log_file.as_str() {
        "stderr" | "" => BoxMakeWriter::new(std::io::stderr),
        "stdout" | "-" => BoxMakeWriter::new(std::io::stdout),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("open log file {path}: {e}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
    };

    match log.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize JSON tracing subscriber: {e}"))?;
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .try_init()
                .map_err(|e| {
                    anyhow::anyhow!("failed to initialize pretty tracing subscriber: {e}")
                })?;
        }
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{other}', expected 'json' or 'pretty'"
            ));
        }
    }

    Ok(())
}
