//! Listener capability and the handle returned on registration

use crate::error::{MonitorError, Result};
use crate::watch_manager::WatchManager;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Monotonic identifier assigned by the watch manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client code that wants to hear about changes
///
/// Only `path_pattern` is required. Every callback defaults to a no-op, so
/// implementors override the events they care about. Callbacks run on a
/// worker thread; returning `Err` (or panicking) is logged and does not
/// affect delivery to other listeners.
pub trait Listener: Send + Sync {
    /// Absolute, `~`-prefixed, or project-relative glob (`*`, `?`, `**`)
    fn path_pattern(&self) -> &str;

    /// Extra per-path predicate applied after the pattern matches
    fn filter(&self, _path: &Path) -> bool {
        true
    }

    /// Debounce window for this listener; the engine default applies when larger
    fn debounce_delay_ms(&self) -> u64 {
        0
    }

    fn on_file_created(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_file_modified(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_file_deleted(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_directory_created(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_directory_deleted(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_symlink_created(&self, _path: &Path, _target: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_symlink_deleted(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_symlink_target_changed(
        &self,
        _path: &Path,
        _old_target: &Path,
        _new_target: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ownership token for one registered listener
///
/// The handle points at the manager only weakly; dropping the handle does not
/// unregister the listener, `unregister()` does.
pub struct WatchHandle {
    id: ListenerId,
    listener: Arc<dyn Listener>,
    manager: Weak<WatchManager>,
    active: AtomicBool,
}

impl WatchHandle {
    pub(crate) fn new(id: ListenerId, listener: Arc<dyn Listener>, manager: Weak<WatchManager>) -> Self {
        Self {
            id,
            listener,
            manager,
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Directories currently watched on behalf of this listener
    ///
    /// Empty once the handle is inactive.
    pub fn watched_paths(&self) -> HashSet<PathBuf> {
        if !self.is_active() {
            return HashSet::new();
        }
        self.manager
            .upgrade()
            .map(|manager| manager.watched_paths(self.id))
            .unwrap_or_default()
    }

    /// Stop delivering events and release every watched path
    ///
    /// Fails with `WatchNotActive` on any call after the first.
    pub fn unregister(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(MonitorError::WatchNotActive(self.id));
        }
        match self.manager.upgrade() {
            Some(manager) => manager.unregister_listener(self.id),
            // Manager already torn down: nothing left to release
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("pattern", &self.listener.path_pattern())
            .field("active", &self.is_active())
            .finish()
    }
}
