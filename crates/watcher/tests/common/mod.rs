//! Shared helpers for monitor integration tests

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use fs_monitor::path::match_string;
use fs_monitor::{EventType, FileSystemMonitor, Listener, MonitorConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One delivered callback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event_type: EventType,
    pub path: PathBuf,
    pub at: Instant,
}

/// Listener that forwards every callback into a channel
pub struct Recorder {
    pattern: String,
    delay_ms: u64,
    tx: Sender<Delivery>,
}

impl Recorder {
    pub fn new(pattern: impl Into<String>, delay_ms: u64) -> (Self, Receiver<Delivery>) {
        let (tx, rx) = unbounded();
        let recorder = Self {
            pattern: pattern.into(),
            delay_ms,
            tx,
        };
        (recorder, rx)
    }

    fn push(&self, event_type: EventType, path: &Path) -> anyhow::Result<()> {
        let _ = self.tx.send(Delivery {
            event_type,
            path: path.to_path_buf(),
            at: Instant::now(),
        });
        Ok(())
    }
}

impl Listener for Recorder {
    fn path_pattern(&self) -> &str {
        &self.pattern
    }

    fn debounce_delay_ms(&self) -> u64 {
        self.delay_ms
    }

    fn on_file_created(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::FileCreated, path)
    }

    fn on_file_modified(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::FileModified, path)
    }

    fn on_file_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::FileDeleted, path)
    }

    fn on_directory_created(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::DirectoryCreated, path)
    }

    fn on_directory_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::DirectoryDeleted, path)
    }

    fn on_symlink_created(&self, path: &Path, _target: &Path) -> anyhow::Result<()> {
        self.push(EventType::SymlinkCreated, path)
    }

    fn on_symlink_deleted(&self, path: &Path) -> anyhow::Result<()> {
        self.push(EventType::SymlinkDeleted, path)
    }

    fn on_symlink_target_changed(
        &self,
        path: &Path,
        _old_target: &Path,
        _new_target: &Path,
    ) -> anyhow::Result<()> {
        self.push(EventType::SymlinkTargetChanged, path)
    }
}

/// `<root>/<suffix>` as a pattern string
pub fn pattern_under(root: &Path, suffix: &str) -> String {
    format!("{}/{}", match_string(root), suffix)
}

pub fn native_config() -> MonitorConfig {
    MonitorConfig {
        default_debounce_ms: 0,
        thread_count: 2,
        ..MonitorConfig::default()
    }
}

pub fn polling_config() -> MonitorConfig {
    let mut config = native_config();
    config.polling_fallback.enabled = true;
    config.polling_fallback.poll_interval = 0.05;
    config
}

pub fn monitor(config: MonitorConfig, root: &Path) -> FileSystemMonitor {
    FileSystemMonitor::new(config, root).unwrap()
}

/// Wait for the first delivery matching `event_type` and `path`
pub fn wait_for(
    rx: &Receiver<Delivery>,
    event_type: EventType,
    path: &Path,
    timeout: Duration,
) -> Option<Delivery> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(remaining) {
            Ok(delivery) if delivery.event_type == event_type && delivery.path == path => {
                return Some(delivery)
            }
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Everything delivered within `window`
pub fn drain(rx: &Receiver<Delivery>, window: Duration) -> Vec<Delivery> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(delivery) => out.push(delivery),
            Err(_) => break,
        }
    }
    out
}
