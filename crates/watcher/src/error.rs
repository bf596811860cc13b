//! Error types for the monitoring engine

use crate::listener::ListenerId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the monitoring engine
///
/// Registration-time failures (bad pattern, unresolvable path) reach the
/// caller of `register_listener`. Failures while processing events are logged
/// and never show up here.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The native watch syscall failed for a path
    #[error("Failed to create watch for {path}: {source}")]
    WatchCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Operation on a watch that has already been unregistered
    #[error("Watch for listener {0} is not active")]
    WatchNotActive(ListenerId),

    /// Malformed path pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    /// A relative path could not be made absolute
    #[error("Cannot resolve path {path}: {reason}")]
    PathResolution { path: PathBuf, reason: String },

    /// OS-level watch or descriptor limits hit
    #[error("Watch resources exhausted for {path}: {reason}")]
    ResourceExhausted { path: PathBuf, reason: String },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Component used before `start()` or after `stop()`
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// No monitor implementation for this platform
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MonitorError {
    /// Classify a failed native watch call
    ///
    /// Descriptor and watch limits map to `ResourceExhausted`, everything else
    /// to `WatchCreation`.
    pub fn from_watch_failure(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_exhaustion(&source) {
            MonitorError::ResourceExhausted {
                path,
                reason: source.to_string(),
            }
        } else {
            MonitorError::WatchCreation { path, source }
        }
    }

    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        MonitorError::Pattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(unix)]
fn is_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

#[cfg(windows)]
fn is_exhaustion(err: &io::Error) -> bool {
    use windows_sys::Win32::Foundation::{
        ERROR_NOT_ENOUGH_MEMORY, ERROR_NOT_ENOUGH_QUOTA, ERROR_TOO_MANY_OPEN_FILES,
    };
    err.raw_os_error().is_some_and(|code| {
        let code = code as u32;
        code == ERROR_NOT_ENOUGH_MEMORY || code == ERROR_NOT_ENOUGH_QUOTA || code == ERROR_TOO_MANY_OPEN_FILES
    })
}

#[cfg(not(any(unix, windows)))]
fn is_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Result type for monitoring operations
pub type Result<T> = std::result::Result<T, MonitorError>;
