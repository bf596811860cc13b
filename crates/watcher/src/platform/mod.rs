//! Platform-specific file watching implementations
//!
//! Every backend implements [`MonitorBase`] and reports what it sees through
//! a shared [`MonitorContext`], which applies the log-file and ignore filters
//! before anything reaches the dispatcher.
//!
//! Backend selection is static per target:
//! - Linux: inotify ([`linux::InotifyMonitor`]); a failure to initialize is fatal
//! - Windows: `ReadDirectoryChangesW` ([`windows::WindowsMonitor`])
//! - everything else, or when `polling_fallback.enabled` is set: [`polling::PollingMonitor`]
//!
//! macOS has no native backend here. Under polling a rename shows up as an
//! uncorrelated delete plus create.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(windows)]
pub mod windows;

pub mod polling;

use crate::config::MonitorConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::event::{EventType, FileSystemEvent};
use crate::ignore::IgnoreRules;
use crate::path::is_log_file;
use crate::resource::WatchDescriptor;
use crate::watch_manager::WatchManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Common contract of the native and polling monitors
///
/// Watches are always directories. Only the watch manager (through its
/// resource tracker) calls `add_watch`/`remove_watch`.
pub trait MonitorBase: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Open native handles and spawn the I/O thread(s)
    fn start(&self) -> Result<()>;

    /// Stop the I/O thread(s) and close every native handle
    fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Start watching the directory `path`
    fn add_watch(&self, path: &Path) -> Result<WatchDescriptor>;

    /// Release the watch previously returned for `path`
    fn remove_watch(&self, path: &Path, descriptor: WatchDescriptor) -> Result<()>;
}

/// What a backend needs to turn observations into dispatched events
#[derive(Clone)]
pub struct MonitorContext {
    dispatcher: Arc<EventDispatcher>,
    ignore: Arc<IgnoreRules>,
}

impl MonitorContext {
    pub fn new(dispatcher: Arc<EventDispatcher>, ignore: Arc<IgnoreRules>) -> Self {
        Self { dispatcher, ignore }
    }

    fn watch_manager(&self) -> &Arc<WatchManager> {
        self.dispatcher.watch_manager()
    }

    /// Forward an event unless it is a log file or ignored
    ///
    /// The log-file check is unconditional so the monitor's own log output
    /// can never feed back into it.
    pub fn dispatch(&self, event: FileSystemEvent) {
        if is_log_file(event.path()) {
            trace!("Skipping log file {}", event.path().display());
            return;
        }
        let is_dir = matches!(
            event.event_type(),
            EventType::DirectoryCreated | EventType::DirectoryDeleted
        );
        if self.ignore.should_ignore(event.path(), is_dir) {
            trace!("Ignoring {}", event.path().display());
            return;
        }
        self.dispatcher.dispatch_event(event);
    }

    /// Shorthand for building and dispatching a plain or symlink event
    pub fn dispatch_event(
        &self,
        event_type: EventType,
        path: &Path,
        old_target: Option<&Path>,
        new_target: Option<&Path>,
    ) {
        let event = match (event_type, old_target, new_target) {
            (EventType::SymlinkTargetChanged, Some(old), Some(new)) => {
                FileSystemEvent::symlink_target_changed(path, old, new)
            }
            (EventType::SymlinkCreated, _, Some(target)) => FileSystemEvent::symlink_created(path, target),
            _ => FileSystemEvent::new(event_type, path),
        };
        self.dispatch(event);
    }

    /// Resolve a native descriptor back to its watched directory
    pub fn path_for_descriptor(&self, descriptor: WatchDescriptor) -> Option<PathBuf> {
        self.watch_manager().resources().path_for_descriptor(descriptor)
    }

    pub fn is_watched_dir(&self, path: &Path) -> bool {
        self.watch_manager().is_watched(path)
    }

    /// A directory appeared: extend watches, then report what is already inside
    ///
    /// Entries written between the `mkdir` and the new watch would otherwise
    /// go unnoticed; duplicates of events the new watch also reports collapse
    /// in the debouncer.
    pub fn directory_created(&self, dir: &Path, symlinks: Option<&SymlinkTable>) {
        let added = self.watch_manager().directory_created(dir);
        for watched in &added {
            let Ok(entries) = fs::read_dir(watched) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                match classify(&path) {
                    Some(PathKind::Symlink(target)) => {
                        if let Some(table) = symlinks {
                            table.record(&path, &target);
                        }
                        self.dispatch(FileSystemEvent::symlink_created(&path, target));
                    }
                    Some(PathKind::Directory) => {
                        self.dispatch(FileSystemEvent::new(EventType::DirectoryCreated, &path));
                    }
                    Some(PathKind::File) => {
                        self.dispatch(FileSystemEvent::new(EventType::FileCreated, &path));
                    }
                    None => {}
                }
            }
        }
    }

    /// A directory left the tree: drop its watches and the ones below it
    pub fn directory_removed(&self, dir: &Path) {
        self.watch_manager().directory_removed(dir);
    }

    /// Report a path that was created or moved in
    ///
    /// Looks at the file system to tell files, directories and symlinks
    /// apart. A symlink that replaces a known one with a different target is
    /// reported as a target change.
    pub fn report_created(&self, path: &Path, symlinks: &SymlinkTable, counterpart: Option<&Path>) {
        let with_counterpart = |event: FileSystemEvent| match counterpart {
            Some(other) => event.with_rename_counterpart(other),
            None => event,
        };

        match classify(path) {
            Some(PathKind::Symlink(target)) => match symlinks.record(path, &target) {
                Some(old) if old != target && counterpart.is_none() => {
                    self.dispatch(FileSystemEvent::symlink_target_changed(path, old, target));
                }
                Some(old) if old == target && counterpart.is_none() => {}
                _ => self.dispatch(with_counterpart(FileSystemEvent::symlink_created(path, target))),
            },
            Some(PathKind::Directory) => {
                self.dispatch(with_counterpart(FileSystemEvent::new(EventType::DirectoryCreated, path)));
                self.directory_created(path, Some(symlinks));
            }
            Some(PathKind::File) => {
                self.dispatch(with_counterpart(FileSystemEvent::new(EventType::FileCreated, path)));
            }
            // Already gone again
            None => {}
        }
    }

    /// Report a path that was deleted or moved out
    ///
    /// `is_dir` comes from the native event where available; the path itself
    /// no longer exists to be inspected.
    pub fn report_removed(&self, path: &Path, is_dir: bool, symlinks: &SymlinkTable, counterpart: Option<&Path>) {
        let event_type = if symlinks.forget(path).is_some() {
            EventType::SymlinkDeleted
        } else if is_dir || self.is_watched_dir(path) {
            EventType::DirectoryDeleted
        } else {
            EventType::FileDeleted
        };

        let mut event = FileSystemEvent::new(event_type, path);
        if let Some(other) = counterpart {
            event = event.with_rename_counterpart(other);
        }
        self.dispatch(event);

        if event_type == EventType::DirectoryDeleted {
            symlinks.forget_under(path);
            self.directory_removed(path);
        }
    }

    /// Report a content change on a file
    pub fn report_modified(&self, path: &Path, symlinks: &SymlinkTable) {
        if let Some(old) = symlinks.target(path) {
            if let Ok(new) = fs::read_link(path) {
                if new != old {
                    symlinks.record(path, &new);
                    self.dispatch(FileSystemEvent::symlink_target_changed(path, old, new));
                }
            }
            return;
        }
        self.dispatch(FileSystemEvent::new(EventType::FileModified, path));
    }

    /// Rename observed as a correlated pair
    pub fn report_rename(&self, from: &Path, to: &Path, is_dir: bool, symlinks: &SymlinkTable) {
        trace!("Rename {} -> {}", from.display(), to.display());
        self.report_removed(from, is_dir, symlinks, Some(to));
        self.report_created(to, symlinks, Some(from));
    }
}

/// What a path currently is on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathKind {
    File,
    Directory,
    Symlink(PathBuf),
}

/// Inspect `path` without following symlinks
pub(crate) fn classify(path: &Path) -> Option<PathKind> {
    let metadata = fs::symlink_metadata(path).ok()?;
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path).unwrap_or_default();
        Some(PathKind::Symlink(target))
    } else if file_type.is_dir() {
        Some(PathKind::Directory)
    } else {
        Some(PathKind::File)
    }
}

/// Known symlinks and their targets
///
/// Native events do not say whether a deleted path was a symlink; this table
/// remembers the ones seen so far.
#[derive(Default)]
pub struct SymlinkTable {
    links: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl SymlinkTable {
    /// Remember a symlink; returns the previously recorded target
    pub fn record(&self, path: &Path, target: &Path) -> Option<PathBuf> {
        self.links.lock().insert(path.to_path_buf(), target.to_path_buf())
    }

    pub fn forget(&self, path: &Path) -> Option<PathBuf> {
        self.links.lock().remove(path)
    }

    pub fn forget_under(&self, dir: &Path) {
        self.links.lock().retain(|path, _| !path.starts_with(dir));
    }

    pub fn clear(&self) {
        self.links.lock().clear();
    }

    pub fn target(&self, path: &Path) -> Option<PathBuf> {
        self.links.lock().get(path).cloned()
    }

    /// Record the symlinks directly inside `dir`
    pub fn seed(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut links = self.links.lock();
        for entry in entries.filter_map(|e| e.ok()) {
            let is_symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            if is_symlink {
                let path = entry.path();
                if let Ok(target) = fs::read_link(&path) {
                    links.insert(path, target);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

/// Build the monitor for this target
///
/// `polling_fallback.enabled` forces the polling monitor everywhere.
pub fn create_monitor(config: &MonitorConfig, ctx: MonitorContext) -> Result<Arc<dyn MonitorBase>> {
    if config.polling_fallback.enabled {
        tracing::info!("Polling monitor selected by configuration");
        return Ok(Arc::new(polling::PollingMonitor::new(&config.polling_fallback, ctx)));
    }
    native_monitor(config, ctx)
}

#[cfg(target_os = "linux")]
fn native_monitor(_config: &MonitorConfig, ctx: MonitorContext) -> Result<Arc<dyn MonitorBase>> {
    Ok(Arc::new(linux::InotifyMonitor::new(ctx)))
}

#[cfg(windows)]
fn native_monitor(_config: &MonitorConfig, ctx: MonitorContext) -> Result<Arc<dyn MonitorBase>> {
    Ok(Arc::new(windows::WindowsMonitor::new(ctx)))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn native_monitor(config: &MonitorConfig, ctx: MonitorContext) -> Result<Arc<dyn MonitorBase>> {
    tracing::info!("No native monitor on this platform, using polling");
    Ok(Arc::new(polling::PollingMonitor::new(&config.polling_fallback, ctx)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use crate::path::match_string;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Sink {
        pattern: String,
        tx: Sender<FileSystemEvent>,
    }

    impl Listener for Sink {
        fn path_pattern(&self) -> &str {
            &self.pattern
        }

        fn on_file_created(&self, path: &Path) -> anyhow::Result<()> {
            self.tx.send(FileSystemEvent::new(EventType::FileCreated, path))?;
            Ok(())
        }

        fn on_file_deleted(&self, path: &Path) -> anyhow::Result<()> {
            self.tx.send(FileSystemEvent::new(EventType::FileDeleted, path))?;
            Ok(())
        }

        fn on_file_modified(&self, path: &Path) -> anyhow::Result<()> {
            self.tx.send(FileSystemEvent::new(EventType::FileModified, path))?;
            Ok(())
        }
    }

    fn context(root: &Path, ignore: &[&str]) -> (MonitorContext, Arc<EventDispatcher>, Receiver<FileSystemEvent>) {
        let config = MonitorConfig {
            default_debounce_ms: 0,
            thread_count: 1,
            ignore_patterns: ignore.iter().map(|s| s.to_string()).collect(),
            ..MonitorConfig::default()
        };
        let rules = Arc::new(IgnoreRules::load(root, &config).unwrap());
        let manager = WatchManager::new(root, &config, Arc::clone(&rules));
        let dispatcher = EventDispatcher::new(Arc::clone(&manager), &config);

        let (tx, rx) = unbounded();
        manager
            .register_listener(Arc::new(Sink {
                pattern: format!("{}/**", match_string(root)),
                tx,
            }))
            .unwrap();
        dispatcher.start().unwrap();
        (MonitorContext::new(Arc::clone(&dispatcher), rules), dispatcher, rx)
    }

    #[test]
    fn test_log_files_never_dispatched() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let (ctx, dispatcher, rx) = context(root, &[]);

        ctx.dispatch_event(EventType::FileModified, &root.join(".dbp/logs/server.log"), None, None);
        ctx.dispatch_event(EventType::FileModified, &root.join("fsmon.log.2024-01-01"), None, None);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(dispatcher.stats().received, 0);

        ctx.dispatch_event(EventType::FileModified, &root.join("main.rs"), None, None);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().path(),
            root.join("main.rs")
        );
        dispatcher.stop();
    }

    #[test]
    fn test_ignored_paths_never_dispatched() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let (ctx, dispatcher, rx) = context(root, &["*.tmp"]);

        ctx.dispatch_event(EventType::FileCreated, &root.join("scratch.tmp"), None, None);
        ctx.dispatch_event(EventType::FileCreated, &root.join(".git/index"), None, None);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        dispatcher.stop();
    }

    #[test]
    fn test_new_directory_contents_are_reported() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let (ctx, dispatcher, rx) = context(root, &[]);

        fs::create_dir(root.join("newdir")).unwrap();
        fs::write(root.join("newdir/early.txt"), b"x").unwrap();
        ctx.report_created(&root.join("newdir"), &SymlinkTable::default(), None);

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.event_type(), EventType::FileCreated);
        assert_eq!(event.path(), root.join("newdir/early.txt"));
        assert!(ctx.is_watched_dir(&root.join("newdir")));
        dispatcher.stop();
    }

    #[test]
    fn test_removed_directory_drops_watch() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("gone")).unwrap();
        let (ctx, dispatcher, _rx) = context(root, &[]);
        assert!(ctx.is_watched_dir(&root.join("gone")));

        fs::remove_dir(root.join("gone")).unwrap();
        ctx.report_removed(&root.join("gone"), false, &SymlinkTable::default(), None);
        assert!(!ctx.is_watched_dir(&root.join("gone")));
        dispatcher.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_table_classifies_changes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let link = root.join("current");
        std::os::unix::fs::symlink("v1", &link).unwrap();

        let table = SymlinkTable::default();
        table.seed(root);
        assert_eq!(table.target(&link), Some(PathBuf::from("v1")));
        assert_eq!(classify(&link), Some(PathKind::Symlink(PathBuf::from("v1"))));
        assert_eq!(classify(root), Some(PathKind::Directory));
        assert_eq!(classify(&root.join("missing")), None);

        table.forget_under(root);
        assert!(table.is_empty());
    }
}
