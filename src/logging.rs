//! Tracing subscriber setup for the CLI.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

/// Environment variable holding the filter directives, e.g. `strata=debug`.
pub const LOG_ENV: &str = "STRATA_LOG";
pub const LOG_FILE: &str = "strata.log";

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub verbose: bool,
    /// Emit JSON lines on stderr instead of human-readable output.
    pub json: bool,
    /// Also write to `<log_dir>/strata.log`.
    pub log_dir: Option<PathBuf>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match options.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let human_layer = (!options.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(options.verbose)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(options.verbose))
        .with(json_layer)
        .with(human_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
