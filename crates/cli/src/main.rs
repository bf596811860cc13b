//! fsmon - watch paths and print file system events

use anyhow::{Context, Result};
use clap::Parser;
use fs_monitor::path::find_git_root;
use fs_monitor::{FileSystemMonitor, MonitorConfig};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod logging;
mod printer;

use printer::EventPrinter;

/// fsmon - print file system events for glob patterns
#[derive(Parser, Debug)]
#[command(name = "fsmon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Glob patterns to watch (`*`, `?`, `**`); relative patterns resolve against the root
    #[arg(required = true)]
    patterns: Vec<String>,

    /// Project root (default: Git root of the current directory, else the current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// TOML monitor configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Worker threads for listener callbacks
    #[arg(long)]
    threads: Option<usize>,

    /// Only watch the top level of each pattern's base directory
    #[arg(long)]
    no_recursive: bool,

    /// Use the polling monitor instead of the native backend
    #[arg(long)]
    poll: bool,

    /// Polling interval in seconds
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Additional gitignore-syntax ignore pattern (repeatable)
    #[arg(long = "ignore")]
    ignore: Vec<String>,

    /// Also write a daily rolling log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    /// Loaded (or default) configuration with command-line overrides applied
    fn monitor_config(&self) -> Result<MonitorConfig> {
        let mut config = match &self.config {
            Some(path) => MonitorConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => MonitorConfig::default(),
        };

        if let Some(ms) = self.debounce_ms {
            config.default_debounce_ms = ms;
        }
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if self.no_recursive {
            config.recursive = false;
        }
        if self.poll {
            config.polling_fallback.enabled = true;
        }
        if let Some(interval) = self.poll_interval {
            config.polling_fallback.poll_interval = interval;
        }
        config.ignore_patterns.extend(self.ignore.iter().cloned());

        config.validate().context("Invalid monitor configuration")?;
        Ok(config)
    }

    fn project_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(find_git_root(&cwd).unwrap_or(cwd))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_dir.as_deref())?;

    let config = cli.monitor_config()?;
    let root = cli.project_root()?;

    let monitor = FileSystemMonitor::new(config, &root)
        .with_context(|| format!("Failed to create monitor for {}", root.display()))?;

    for pattern in &cli.patterns {
        monitor
            .register_listener(Arc::new(EventPrinter::new(pattern.clone())))
            .with_context(|| format!("Failed to watch '{}'", pattern))?;
    }

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    monitor.start().context("Failed to start file system monitor")?;

    eprintln!(
        "{} {} ({} pattern(s), {} backend) - press Ctrl-C to stop",
        "Watching".bold(),
        monitor.project_root().display().cyan(),
        cli.patterns.len(),
        monitor.backend_name().unwrap_or("unknown")
    );

    // Sender lives in the signal handler for the rest of the process
    let _ = stop_rx.recv();

    monitor.stop().context("Failed to stop file system monitor")?;
    let stats = monitor.stats();
    info!(
        "Received {} event(s), dispatched {}, {} listener failure(s)",
        stats.received, stats.dispatched, stats.listener_failures
    );
    Ok(())
}
