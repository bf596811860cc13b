//! File system monitoring engine
//!
//! This crate watches directories through the platform's native change
//! notification API and delivers typed events to listeners:
//! - Reference-counted native watches shared across listeners
//! - Glob path patterns (`*`, `?`, `**`) resolved against a project root
//! - Per-path debouncing that collapses bursts of identical events
//! - Listener callbacks executed on a fixed worker pool
//! - inotify on Linux, `ReadDirectoryChangesW` on Windows, polling elsewhere
//!
//! ```no_run
//! use fs_monitor::{FileSystemMonitor, Listener, MonitorConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! struct Rebuild;
//!
//! impl Listener for Rebuild {
//!     fn path_pattern(&self) -> &str {
//!         "src/**/*.rs"
//!     }
//!
//!     fn on_file_modified(&self, path: &Path) -> anyhow::Result<()> {
//!         println!("changed: {}", path.display());
//!         Ok(())
//!     }
//! }
//!
//! let monitor = FileSystemMonitor::new(MonitorConfig::default(), ".")?;
//! let handle = monitor.register_listener(Arc::new(Rebuild))?;
//! monitor.start()?;
//! // ...
//! handle.unregister()?;
//! monitor.stop()?;
//! # Ok::<(), fs_monitor::MonitorError>(())
//! ```

pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ignore;
pub mod listener;
pub mod monitor;
pub mod path;
pub mod pattern;
pub mod platform;
pub mod resource;
pub mod thread_pool;
pub mod watch_manager;

pub use config::{MonitorConfig, PollingConfig};
pub use dispatcher::{DispatchStats, EventDispatcher, ObserverFn, ObserverId};
pub use error::{MonitorError, Result};
pub use event::{EventType, FileSystemEvent};
pub use listener::{Listener, ListenerId, WatchHandle};
pub use monitor::FileSystemMonitor;
pub use pattern::{pattern_to_matcher, PathPattern};
pub use platform::{MonitorBase, MonitorContext};
