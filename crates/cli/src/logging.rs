//! Tracing subscriber setup for the fsmon binary

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "FSMON_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber
///
/// Logs go to stderr so event lines on stdout stay pipeable. With a log
/// directory, a daily rolling `fsmon.log.<date>` file is written as well.
pub fn init(log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "fsmon.log");
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false) // No ANSI colors in log files
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}
