//! Reference-counted native watch resources
//!
//! One `ResourceData` per absolute path under watch. Listeners watching the
//! same path share the record (and the native handle behind it); the cleanup
//! callback fires once, when the last listener lets go.

use crate::listener::ListenerId;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Native watch identifier handed out by a platform monitor
///
/// An inotify watch descriptor on Linux, a per-directory watch id elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchDescriptor(pub i64);

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd:{}", self.0)
    }
}

/// Opaque per-watch data a platform monitor may attach
pub type PlatformData = Arc<dyn Any + Send + Sync>;

/// Invoked with `(path, descriptor)` when a path's last reference goes away
pub type CleanupFn = Box<dyn Fn(&Path, Option<WatchDescriptor>) + Send + Sync>;

/// Snapshot of one tracked path
#[derive(Clone)]
pub struct ResourceData {
    pub path: PathBuf,
    pub descriptor: Option<WatchDescriptor>,
    pub platform_data: Option<PlatformData>,
    pub listeners: HashSet<ListenerId>,
}

impl ResourceData {
    /// Number of listeners holding this path (always `listeners.len()`)
    pub fn ref_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for ResourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceData")
            .field("path", &self.path)
            .field("ref_count", &self.ref_count())
            .field("descriptor", &self.descriptor)
            .field("listeners", &self.listeners)
            .finish()
    }
}

#[derive(Default)]
struct TrackerState {
    resources: HashMap<PathBuf, ResourceData>,
    /// descriptor -> path, for routing native events
    by_descriptor: HashMap<WatchDescriptor, PathBuf>,
}

/// Path -> resource registry guarded by a single mutex
///
/// The cleanup callback is always invoked after the mutex is released.
pub struct ResourceTracker {
    state: Mutex<TrackerState>,
    cleanup: CleanupFn,
}

impl ResourceTracker {
    pub fn new(cleanup: CleanupFn) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            cleanup,
        }
    }

    /// Add a reference from `listener_id` to `path`
    ///
    /// Returns the record after the update. Adding the same listener twice
    /// does not change the count.
    pub fn add_resource(&self, path: &Path, listener_id: ListenerId) -> ResourceData {
        let mut state = self.state.lock();
        let entry = state
            .resources
            .entry(path.to_path_buf())
            .or_insert_with(|| ResourceData {
                path: path.to_path_buf(),
                descriptor: None,
                platform_data: None,
                listeners: HashSet::new(),
            });
        entry.listeners.insert(listener_id);
        debug!(
            "Resource {} now has {} reference(s)",
            path.display(),
            entry.ref_count()
        );
        entry.clone()
    }

    /// Drop the reference from `listener_id` to `path`
    ///
    /// Returns `true` when this was the last reference: the record is gone
    /// and the cleanup callback has run.
    pub fn remove_resource(&self, path: &Path, listener_id: ListenerId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(entry) = state.resources.get_mut(path) else {
                return false;
            };
            if !entry.listeners.remove(&listener_id) {
                return false;
            }
            if entry.ref_count() > 0 {
                return false;
            }
            let mut removed = state.resources.remove(path);
            if let Some(resource) = removed.as_mut() {
                if let Some(descriptor) = resource.descriptor {
                    if state.by_descriptor.get(&descriptor).map(PathBuf::as_path) == Some(path) {
                        state.by_descriptor.remove(&descriptor);
                    }
                    // Another path still routes through the same native handle
                    // (a renamed directory keeps its inotify descriptor)
                    let other = state
                        .resources
                        .values()
                        .find(|other| other.descriptor == Some(descriptor))
                        .map(|other| other.path.clone());
                    if let Some(other) = other {
                        state.by_descriptor.insert(descriptor, other);
                        resource.descriptor = None;
                    }
                }
            }
            removed
        };

        match removed {
            Some(resource) => {
                debug!("Releasing resource {}", path.display());
                (self.cleanup)(&resource.path, resource.descriptor);
                true
            }
            None => false,
        }
    }

    /// Associate a native handle with a tracked path
    ///
    /// Returns `false` if the path is not tracked (it was released while the
    /// platform layer was creating the watch).
    pub fn set_os_descriptor(
        &self,
        path: &Path,
        descriptor: WatchDescriptor,
        platform_data: Option<PlatformData>,
    ) -> bool {
        let mut state = self.state.lock();
        let previous = match state.resources.get_mut(path) {
            Some(entry) => {
                let previous = entry.descriptor.replace(descriptor);
                entry.platform_data = platform_data;
                previous
            }
            None => return false,
        };
        if let Some(previous) = previous {
            state.by_descriptor.remove(&previous);
        }
        state.by_descriptor.insert(descriptor, path.to_path_buf());
        true
    }

    /// Forget every native handle without running cleanup
    ///
    /// Used when the platform monitor has closed all of its handles at once.
    pub fn clear_descriptors(&self) {
        let mut state = self.state.lock();
        state.by_descriptor.clear();
        for entry in state.resources.values_mut() {
            entry.descriptor = None;
            entry.platform_data = None;
        }
    }

    pub fn get(&self, path: &Path) -> Option<ResourceData> {
        self.state.lock().resources.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().resources.contains_key(path)
    }

    pub fn path_for_descriptor(&self, descriptor: WatchDescriptor) -> Option<PathBuf> {
        self.state.lock().by_descriptor.get(&descriptor).cloned()
    }

    pub fn descriptor_for(&self, path: &Path) -> Option<WatchDescriptor> {
        self.state.lock().resources.get(path).and_then(|r| r.descriptor)
    }

    /// Tracked paths that have no native handle yet
    pub fn paths_without_descriptor(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .resources
            .values()
            .filter(|r| r.descriptor.is_none())
            .map(|r| r.path.clone())
            .collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().resources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tracker() -> (ResourceTracker, Arc<Mutex<Vec<(PathBuf, Option<WatchDescriptor>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let tracker = ResourceTracker::new(Box::new(move |path, descriptor| {
            sink.lock().push((path.to_path_buf(), descriptor));
        }));
        (tracker, calls)
    }

    #[test]
    fn test_shared_path_refcount() {
        let (tracker, calls) = counting_tracker();
        let path = Path::new("/proj/src");

        let first = tracker.add_resource(path, ListenerId(1));
        assert_eq!(first.ref_count(), 1);
        let second = tracker.add_resource(path, ListenerId(2));
        assert_eq!(second.ref_count(), 2);
        assert_eq!(tracker.len(), 1);

        assert!(!tracker.remove_resource(path, ListenerId(1)));
        assert!(calls.lock().is_empty());
        assert_eq!(tracker.get(path).unwrap().ref_count(), 1);

        assert!(tracker.remove_resource(path, ListenerId(2)));
        assert_eq!(calls.lock().len(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_add_keeps_invariant() {
        let (tracker, calls) = counting_tracker();
        let path = Path::new("/proj");

        tracker.add_resource(path, ListenerId(1));
        let again = tracker.add_resource(path, ListenerId(1));
        assert_eq!(again.ref_count(), 1);

        assert!(tracker.remove_resource(path, ListenerId(1)));
        assert!(!tracker.remove_resource(path, ListenerId(1)));
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn test_remove_unknown_listener_is_noop() {
        let (tracker, calls) = counting_tracker();
        let path = Path::new("/proj");
        tracker.add_resource(path, ListenerId(1));

        assert!(!tracker.remove_resource(path, ListenerId(9)));
        assert!(!tracker.remove_resource(Path::new("/elsewhere"), ListenerId(1)));
        assert!(calls.lock().is_empty());
        assert_eq!(tracker.get(path).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_descriptor_reverse_lookup() {
        let (tracker, calls) = counting_tracker();
        let path = Path::new("/proj/src");
        tracker.add_resource(path, ListenerId(1));

        assert!(tracker.set_os_descriptor(path, WatchDescriptor(42), None));
        assert_eq!(tracker.path_for_descriptor(WatchDescriptor(42)), Some(path.to_path_buf()));
        assert_eq!(tracker.descriptor_for(path), Some(WatchDescriptor(42)));
        assert!(tracker.paths_without_descriptor().is_empty());

        assert!(tracker.remove_resource(path, ListenerId(1)));
        assert_eq!(tracker.path_for_descriptor(WatchDescriptor(42)), None);
        assert_eq!(calls.lock()[0], (path.to_path_buf(), Some(WatchDescriptor(42))));
    }

    #[test]
    fn test_shared_descriptor_not_released_early() {
        let (tracker, calls) = counting_tracker();
        let old = Path::new("/proj/old");
        let new = Path::new("/proj/new");
        tracker.add_resource(old, ListenerId(1));
        tracker.add_resource(new, ListenerId(1));
        tracker.set_os_descriptor(old, WatchDescriptor(5), None);
        tracker.set_os_descriptor(new, WatchDescriptor(5), None);

        assert!(tracker.remove_resource(old, ListenerId(1)));
        assert_eq!(calls.lock()[0], (old.to_path_buf(), None));
        assert_eq!(tracker.path_for_descriptor(WatchDescriptor(5)), Some(new.to_path_buf()));
    }

    #[test]
    fn test_set_descriptor_on_untracked_path() {
        let (tracker, _calls) = counting_tracker();
        assert!(!tracker.set_os_descriptor(Path::new("/gone"), WatchDescriptor(1), None));
        assert_eq!(tracker.path_for_descriptor(WatchDescriptor(1)), None);
    }

    #[test]
    fn test_clear_descriptors_skips_cleanup() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);
        let tracker = ResourceTracker::new(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let path = Path::new("/proj");
        tracker.add_resource(path, ListenerId(1));
        tracker.set_os_descriptor(path, WatchDescriptor(3), None);

        tracker.clear_descriptors();
        assert_eq!(tracker.descriptor_for(path), None);
        assert_eq!(tracker.paths_without_descriptor(), vec![path.to_path_buf()]);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cleanup_may_reenter_tracker() {
        // The callback runs without the tracker lock held
        let tracker = Arc::new_cyclic(|weak: &std::sync::Weak<ResourceTracker>| {
            let weak = weak.clone();
            ResourceTracker::new(Box::new(move |_, _| {
                if let Some(tracker) = weak.upgrade() {
                    assert!(tracker.is_empty());
                }
            }))
        });
        tracker.add_resource(Path::new("/proj"), ListenerId(1));
        assert!(tracker.remove_resource(Path::new("/proj"), ListenerId(1)));
    }
}
