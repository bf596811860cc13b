//! Polling monitor
//!
//! Snapshots every watched directory at a fixed interval and diffs the new
//! listing against the previous one. Used where no native backend exists,
//! or when explicitly configured.
//!
//! A file only counts as modified when its mtime or size changed. Small
//! files (up to `hash_size` bytes) also carry a BLAKE3 content hash, and a
//! metadata change whose hash did not change is not reported.

use super::{MonitorBase, MonitorContext};
use crate::config::PollingConfig;
use crate::error::{MonitorError, Result};
use crate::event::{EventType, FileSystemEvent};
use crate::resource::WatchDescriptor;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// State of one directory entry at snapshot time
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    mtime: Option<SystemTime>,
    size: u64,
    is_dir: bool,
    is_symlink: bool,
    symlink_target: Option<PathBuf>,
    hash: Option<blake3::Hash>,
}

type Snapshot = HashMap<PathBuf, EntryState>;

/// Difference between two snapshots of one directory
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Created(PathBuf, EntryState),
    Deleted(PathBuf, EntryState),
    Modified(PathBuf),
    TargetChanged(PathBuf, PathBuf, PathBuf),
}

struct Watched {
    descriptor: WatchDescriptor,
    snapshot: Snapshot,
}

struct Running {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    watches: Mutex<HashMap<PathBuf, Watched>>,
}

/// Interval-driven snapshot monitor
pub struct PollingMonitor {
    ctx: MonitorContext,
    interval: Duration,
    hash_size: u64,
    shared: Arc<Shared>,
    next_descriptor: AtomicI64,
    running: Mutex<Option<Running>>,
}

impl PollingMonitor {
    pub fn new(config: &PollingConfig, ctx: MonitorContext) -> Self {
        Self {
            ctx,
            interval: config.interval(),
            hash_size: config.hash_size,
            shared: Arc::new(Shared::default()),
            next_descriptor: AtomicI64::new(1),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn watch_count(&self) -> usize {
        self.shared.watches.lock().len()
    }
}

impl MonitorBase for PollingMonitor {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Polling monitor already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let poller = Poller {
            ctx: self.ctx.clone(),
            shared: Arc::clone(&self.shared),
            hash_size: self.hash_size,
        };
        let interval = self.interval;

        let thread = thread::Builder::new()
            .name("fs-monitor-poll".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => poller.poll_once(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        *running = Some(Running { stop_tx, thread });
        info!("Polling monitor started (interval {:?})", self.interval);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let _ = running.stop_tx.send(());
        if running.thread.join().is_err() {
            warn!("Polling thread panicked");
        }
        self.shared.watches.lock().clear();
        info!("Polling monitor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn add_watch(&self, path: &Path) -> Result<WatchDescriptor> {
        let snapshot = scan_dir(path, self.hash_size, None).map_err(|e| MonitorError::from_watch_failure(path, e))?;
        let descriptor = WatchDescriptor(self.next_descriptor.fetch_add(1, Ordering::SeqCst));
        trace!("Polling {} ({} entries)", path.display(), snapshot.len());
        self.shared
            .watches
            .lock()
            .insert(path.to_path_buf(), Watched { descriptor, snapshot });
        Ok(descriptor)
    }

    fn remove_watch(&self, path: &Path, descriptor: WatchDescriptor) -> Result<()> {
        let mut watches = self.shared.watches.lock();
        if watches.get(path).is_some_and(|w| w.descriptor == descriptor) {
            watches.remove(path);
        }
        Ok(())
    }
}

impl Drop for PollingMonitor {
    fn drop(&mut self) {
        let _ = MonitorBase::stop(self);
    }
}

struct Poller {
    ctx: MonitorContext,
    shared: Arc<Shared>,
    hash_size: u64,
}

impl Poller {
    fn poll_once(&self) {
        let mut dirs: Vec<(PathBuf, WatchDescriptor, Snapshot)> = self
            .shared
            .watches
            .lock()
            .iter()
            .map(|(path, w)| (path.clone(), w.descriptor, w.snapshot.clone()))
            .collect();
        // Deepest first, so a removed subtree reports its contents before itself
        dirs.sort_by(|a, b| b.0.cmp(&a.0));

        for (dir, descriptor, previous) in dirs {
            let (fresh, vanished) = match scan_dir(&dir, self.hash_size, Some(&previous)) {
                Ok(fresh) => (fresh, false),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (Snapshot::new(), true),
                Err(e) => {
                    debug!("Cannot scan {}: {}", dir.display(), e);
                    continue;
                }
            };

            let changes = diff(&previous, fresh.clone());
            {
                let mut watches = self.shared.watches.lock();
                match watches.get_mut(&dir) {
                    Some(watched) if watched.descriptor == descriptor => watched.snapshot = fresh,
                    // Released or replaced while we were scanning
                    _ => continue,
                }
            }

            for change in changes {
                self.emit(change);
            }

            if vanished {
                self.ctx
                    .dispatch(FileSystemEvent::new(EventType::DirectoryDeleted, &dir));
                self.ctx.directory_removed(&dir);
            }
        }
    }

    fn emit(&self, change: Change) {
        match change {
            Change::Created(path, state) => {
                if state.is_symlink {
                    let target = state.symlink_target.unwrap_or_default();
                    self.ctx.dispatch(FileSystemEvent::symlink_created(&path, target));
                } else if state.is_dir {
                    self.ctx
                        .dispatch(FileSystemEvent::new(EventType::DirectoryCreated, &path));
                    self.ctx.directory_created(&path, None);
                } else {
                    self.ctx.dispatch(FileSystemEvent::new(EventType::FileCreated, &path));
                }
            }
            Change::Deleted(path, state) => {
                if state.is_symlink {
                    self.ctx.dispatch(FileSystemEvent::new(EventType::SymlinkDeleted, &path));
                } else if state.is_dir {
                    self.ctx
                        .dispatch(FileSystemEvent::new(EventType::DirectoryDeleted, &path));
                    self.ctx.directory_removed(&path);
                } else {
                    self.ctx.dispatch(FileSystemEvent::new(EventType::FileDeleted, &path));
                }
            }
            Change::Modified(path) => {
                self.ctx.dispatch(FileSystemEvent::new(EventType::FileModified, &path));
            }
            Change::TargetChanged(path, old, new) => {
                self.ctx
                    .dispatch(FileSystemEvent::symlink_target_changed(&path, old, new));
            }
        }
    }
}

/// List the direct entries of `dir`
///
/// Hashes are carried over from `previous` for entries whose mtime and size
/// did not move, so unchanged files are not re-read every cycle.
fn scan_dir(dir: &Path, hash_size: u64, previous: Option<&Snapshot>) -> io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        // Raced with a deletion
        let known = previous.and_then(|p| p.get(&path));
        let Ok(state) = entry_state(&path, hash_size, known) else {
            continue;
        };
        snapshot.insert(path, state);
    }
    Ok(snapshot)
}

fn entry_state(path: &Path, hash_size: u64, known: Option<&EntryState>) -> io::Result<EntryState> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    let is_symlink = file_type.is_symlink();
    let is_dir = file_type.is_dir();
    let symlink_target = if is_symlink { fs::read_link(path).ok() } else { None };
    let mtime = metadata.modified().ok();

    let hash = match known {
        _ if is_dir || is_symlink => None,
        Some(k) if k.hash.is_some() && k.mtime == mtime && k.size == metadata.len() => k.hash,
        _ => hash_file(path, metadata.len(), hash_size),
    };

    Ok(EntryState {
        mtime,
        size: metadata.len(),
        is_dir,
        is_symlink,
        symlink_target,
        hash,
    })
}

fn hash_file(path: &Path, size: u64, hash_size: u64) -> Option<blake3::Hash> {
    if hash_size == 0 || size > hash_size {
        return None;
    }
    fs::read(path).ok().map(|bytes| blake3::hash(&bytes))
}

/// Derive the changes between two snapshots of the same directory
///
/// Output order: deletions, creations, then modifications, each sorted by path.
fn diff(previous: &Snapshot, current: Snapshot) -> Vec<Change> {
    let mut deleted = Vec::new();
    let mut created = Vec::new();
    let mut modified = Vec::new();

    for (path, old) in previous {
        match current.get(path) {
            None => deleted.push(Change::Deleted(path.clone(), old.clone())),
            Some(new) if old.is_dir != new.is_dir || old.is_symlink != new.is_symlink => {
                deleted.push(Change::Deleted(path.clone(), old.clone()));
                created.push(Change::Created(path.clone(), new.clone()));
            }
            Some(new) if new.is_symlink => {
                if old.symlink_target != new.symlink_target {
                    modified.push(Change::TargetChanged(
                        path.clone(),
                        old.symlink_target.clone().unwrap_or_default(),
                        new.symlink_target.clone().unwrap_or_default(),
                    ));
                }
            }
            Some(new) if !new.is_dir => {
                let metadata_changed = old.mtime != new.mtime || old.size != new.size;
                let same_content = matches!((&old.hash, &new.hash), (Some(a), Some(b)) if a == b);
                if metadata_changed && !same_content {
                    modified.push(Change::Modified(path.clone()));
                }
            }
            // Directory mtimes move whenever their listing does
            Some(_) => {}
        }
    }

    for (path, new) in current {
        if !previous.contains_key(&path) {
            created.push(Change::Created(path, new));
        }
    }

    let key = |change: &Change| match change {
        Change::Created(p, _) | Change::Deleted(p, _) | Change::Modified(p) | Change::TargetChanged(p, _, _) => {
            p.clone()
        }
    };
    deleted.sort_by_key(key);
    created.sort_by_key(key);
    modified.sort_by_key(key);

    deleted.into_iter().chain(created).chain(modified).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    const HASH_ALL: u64 = 64 * 1024;

    fn bump_mtime(path: &Path, secs: i64) {
        set_file_mtime(path, FileTime::from_unix_time(1_700_000_000 + secs, 0)).unwrap();
    }

    #[test]
    fn test_unchanged_tree_produces_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();

        let before = scan_dir(root, HASH_ALL, None).unwrap();
        let after = scan_dir(root, HASH_ALL, None).unwrap();
        assert!(diff(&before, after).is_empty());
    }

    #[test]
    fn test_created_and_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("old.txt"), b"a").unwrap();
        let before = scan_dir(root, HASH_ALL, None).unwrap();

        fs::remove_file(root.join("old.txt")).unwrap();
        fs::write(root.join("new.txt"), b"b").unwrap();
        fs::create_dir(root.join("dir")).unwrap();

        let changes = diff(&before, scan_dir(root, HASH_ALL, None).unwrap());
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes[0], Change::Deleted(p, _) if p == &root.join("old.txt")));
        assert!(matches!(&changes[1], Change::Created(p, s) if p == &root.join("dir") && s.is_dir));
        assert!(matches!(&changes[2], Change::Created(p, s) if p == &root.join("new.txt") && !s.is_dir));
    }

    #[test]
    fn test_modification_requires_metadata_change() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let file = root.join("a.txt");
        fs::write(&file, b"one").unwrap();
        bump_mtime(&file, 0);
        let before = scan_dir(root, 0, None).unwrap();

        // Content rewritten but mtime and size restored: not a modification
        fs::write(&file, b"two").unwrap();
        bump_mtime(&file, 0);
        assert!(diff(&before, scan_dir(root, 0, None).unwrap()).is_empty());

        bump_mtime(&file, 10);
        let changes = diff(&before, scan_dir(root, 0, None).unwrap());
        assert_eq!(changes, vec![Change::Modified(file)]);
    }

    #[test]
    fn test_identical_content_is_suppressed_by_hash() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let file = root.join("a.txt");
        fs::write(&file, b"same").unwrap();
        bump_mtime(&file, 0);
        let before = scan_dir(root, HASH_ALL, None).unwrap();

        fs::write(&file, b"same").unwrap();
        bump_mtime(&file, 10);
        assert!(diff(&before, scan_dir(root, HASH_ALL, None).unwrap()).is_empty());

        // Without hashing the mtime bump alone counts
        let before = scan_dir(root, 0, None).unwrap();
        bump_mtime(&file, 20);
        assert_eq!(diff(&before, scan_dir(root, 0, None).unwrap()).len(), 1);
    }

    #[test]
    fn test_large_files_are_not_hashed() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("big.bin");
        fs::write(&file, vec![0u8; 128]).unwrap();
        let state = entry_state(&file, 64, None).unwrap();
        assert!(state.hash.is_none());
        assert!(entry_state(&file, 1024, None).unwrap().hash.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_retarget() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let link = root.join("current");
        std::os::unix::fs::symlink("v1", &link).unwrap();
        let before = scan_dir(root, HASH_ALL, None).unwrap();
        assert!(before[&link].is_symlink);

        fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink("v2", &link).unwrap();
        let changes = diff(&before, scan_dir(root, HASH_ALL, None).unwrap());
        assert_eq!(
            changes,
            vec![Change::TargetChanged(link, PathBuf::from("v1"), PathBuf::from("v2"))]
        );
    }

    #[test]
    fn test_type_change_is_delete_then_create() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let path = root.join("thing");
        fs::write(&path, b"file").unwrap();
        let before = scan_dir(root, HASH_ALL, None).unwrap();

        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        let changes = diff(&before, scan_dir(root, HASH_ALL, None).unwrap());
        assert!(matches!(&changes[0], Change::Deleted(_, s) if !s.is_dir));
        assert!(matches!(&changes[1], Change::Created(_, s) if s.is_dir));
    }
}
