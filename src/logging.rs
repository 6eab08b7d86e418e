//! Tracing setup for the `sysrev` binary.
//!
//! Logs go to stderr (pretty or JSON) so stdout stays machine-readable, and
//! optionally to a daily-rolled JSON file under `.sysrev/logs`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Keeps the non-blocking file writer alive; drop it only at process exit.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Level directive for a `-v` count, falling back to the configured level.
pub fn level_for_verbosity(configured: &str, verbose: u8) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level.
pub fn init_logging(
    config: &LoggingConfig,
    format: LogFormat,
    verbose: u8,
    log_dir: Option<&Path>,
) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_for_verbosity(&config.level, verbose)))
        .context("Invalid log level")?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose >= 2)
            .with_thread_ids(verbose >= 3)
            .with_line_number(verbose >= 3)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let mut file_guard = None;
    if config.file
        && let Some(dir) = log_dir
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "sysrev.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(verbose, "sysrev logging initialized");
    Ok(LoggingGuard { _file: file_guard })
}
