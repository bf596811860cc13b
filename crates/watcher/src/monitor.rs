//! The monitoring engine as seen by an application

use crate::config::MonitorConfig;
use crate::dispatcher::{DispatchStats, EventDispatcher, ObserverFn, ObserverId};
use crate::error::Result;
use crate::ignore::IgnoreRules;
use crate::listener::{Listener, WatchHandle};
use crate::path::normalize_lexically;
use crate::platform::{create_monitor, MonitorBase, MonitorContext};
use crate::watch_manager::WatchManager;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// One monitoring engine instance
///
/// Owns its watch manager, dispatcher and platform monitor; several
/// instances can run side by side. Listeners may be registered before or
/// after `start()`, and registrations survive a `stop()`/`start()` cycle.
pub struct FileSystemMonitor {
    config: MonitorConfig,
    project_root: PathBuf,
    ignore: Arc<IgnoreRules>,
    watch_manager: Arc<WatchManager>,
    dispatcher: Arc<EventDispatcher>,
    backend: Mutex<Option<Arc<dyn MonitorBase>>>,
}

impl FileSystemMonitor {
    /// Build an engine for `project_root`
    ///
    /// The root anchors relative listener patterns and the ignore rules.
    pub fn new(config: MonitorConfig, project_root: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;

        let root = project_root.as_ref();
        let project_root = if root.is_absolute() {
            normalize_lexically(root)
        } else {
            normalize_lexically(&std::env::current_dir()?.join(root))
        };

        let ignore = Arc::new(IgnoreRules::load(&project_root, &config)?);
        let watch_manager = WatchManager::new(&project_root, &config, Arc::clone(&ignore));
        let dispatcher = EventDispatcher::new(Arc::clone(&watch_manager), &config);

        Ok(Self {
            config,
            project_root,
            ignore,
            watch_manager,
            dispatcher,
            backend: Mutex::new(None),
        })
    }

    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> Result<WatchHandle> {
        self.watch_manager.register_listener(listener)
    }

    /// Start delivery, then the platform monitor
    ///
    /// Platform initialization failures propagate; on Linux there is no
    /// fallback to polling.
    pub fn start(&self) -> Result<()> {
        let mut backend_slot = self.backend.lock();
        if backend_slot.is_some() {
            warn!("File system monitor already running");
            return Ok(());
        }

        self.dispatcher.start()?;

        let ctx = MonitorContext::new(Arc::clone(&self.dispatcher), Arc::clone(&self.ignore));
        let backend = match create_monitor(&self.config, ctx).and_then(|b| b.start().map(|()| b)) {
            Ok(backend) => backend,
            Err(e) => {
                self.dispatcher.stop();
                return Err(e);
            }
        };

        let watches = self.watch_manager.attach_backend(Arc::clone(&backend));
        info!(
            "File system monitor started for {} ({} backend, {} watch(es))",
            self.project_root.display(),
            backend.name(),
            watches
        );
        *backend_slot = Some(backend);
        Ok(())
    }

    /// Stop the platform monitor, then delivery
    ///
    /// Pending debounced events are dropped. Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(backend) = self.backend.lock().take() else {
            return Ok(());
        };

        let stopped = backend.stop();
        self.watch_manager.detach_backend();
        self.dispatcher.stop();
        info!("File system monitor stopped");
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.backend.lock().is_some()
    }

    /// Name of the active platform monitor
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.lock().as_ref().map(|b| b.name())
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn listener_count(&self) -> usize {
        self.watch_manager.listener_count()
    }

    /// See [`EventDispatcher::subscribe`]
    pub fn subscribe(&self, tag: impl Into<String>, callback: ObserverFn) -> ObserverId {
        self.dispatcher.subscribe(tag, callback)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    pub fn set_default_debounce_ms(&self, delay_ms: u64) {
        self.dispatcher.set_default_debounce_ms(delay_ms);
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }
}

impl Drop for FileSystemMonitor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::path::match_string;
    use tempfile::TempDir;

    struct Nop(String);

    impl Listener for Nop {
        fn path_pattern(&self) -> &str {
            &self.0
        }
    }

    fn polling_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.polling_fallback.enabled = true;
        config.polling_fallback.poll_interval = 0.05;
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = MonitorConfig {
            thread_count: 0,
            ..MonitorConfig::default()
        };
        let err = FileSystemMonitor::new(config, temp_dir.path()).err().unwrap();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn test_start_stop_cycle_keeps_registrations() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let monitor = FileSystemMonitor::new(polling_config(), root).unwrap();
        let handle = monitor
            .register_listener(Arc::new(Nop(format!("{}/*", match_string(root)))))
            .unwrap();

        monitor.start().unwrap();
        monitor.start().unwrap();
        assert_eq!(monitor.backend_name(), Some("polling"));

        monitor.stop().unwrap();
        monitor.stop().unwrap();
        assert!(!monitor.is_running());
        assert!(handle.is_active());

        monitor.start().unwrap();
        assert_eq!(monitor.listener_count(), 1);
        monitor.stop().unwrap();
    }

    #[test]
    fn test_independent_instances() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let a = FileSystemMonitor::new(polling_config(), first.path()).unwrap();
        let b = FileSystemMonitor::new(polling_config(), second.path()).unwrap();

        a.register_listener(Arc::new(Nop("*.rs".to_string()))).unwrap();
        assert_eq!(a.listener_count(), 1);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(a.project_root(), first.path());
    }
}
