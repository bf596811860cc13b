//! Listener registry and watched-directory bookkeeping
//!
//! Every listener resolves to a base directory (the literal prefix of its
//! pattern) plus, when recursive, the directories below it. Those directories
//! are the resources tracked by [`ResourceTracker`]; the native watch behind
//! each one is created through whichever platform monitor is attached.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::ignore::IgnoreRules;
use crate::listener::{Listener, ListenerId, WatchHandle};
use crate::path::{self, match_string};
use crate::pattern::PathPattern;
use crate::platform::MonitorBase;
use crate::resource::{ResourceTracker, WatchDescriptor};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

type BackendSlot = Arc<RwLock<Option<Arc<dyn MonitorBase>>>>;

struct ListenerEntry {
    listener: Arc<dyn Listener>,
    pattern: PathPattern,
    base: PathBuf,
    recursive: bool,
    // Bare file-name patterns only match under the project root
    name_only: bool,
    watched: HashSet<PathBuf>,
    initial_matches: Vec<PathBuf>,
}

impl ListenerEntry {
    fn accepts(&self, path: &Path) -> bool {
        (!self.name_only || path.starts_with(&self.base)) && self.pattern.matches(path)
    }
}

#[derive(Clone)]
struct ListenerScope {
    id: ListenerId,
    base: PathBuf,
    recursive: bool,
}

impl ListenerScope {
    /// Whether this listener needs a watch on `dir`
    fn wants(&self, dir: &Path) -> bool {
        if dir == self.base {
            return true;
        }
        if self.recursive && dir.starts_with(&self.base) {
            return true;
        }
        // Ancestors are only watched while the base does not exist yet
        self.base.starts_with(dir) && !self.base.is_dir()
    }
}

/// Registry of listeners and the directories they watch
pub struct WatchManager {
    project_root: PathBuf,
    recursive: bool,
    ignore: Arc<IgnoreRules>,
    resources: ResourceTracker,
    backend: BackendSlot,
    listeners: Mutex<HashMap<ListenerId, ListenerEntry>>,
    next_id: AtomicU64,
    self_ref: Weak<WatchManager>,
}

impl WatchManager {
    pub fn new(project_root: &Path, config: &MonitorConfig, ignore: Arc<IgnoreRules>) -> Arc<Self> {
        let backend: BackendSlot = Arc::new(RwLock::new(None));
        let cleanup_backend = Arc::clone(&backend);

        Arc::new_cyclic(|self_ref| Self {
            project_root: project_root.to_path_buf(),
            recursive: config.recursive,
            ignore,
            resources: ResourceTracker::new(Box::new(move |path, descriptor| {
                let Some(descriptor) = descriptor else {
                    return;
                };
                let backend = cleanup_backend.read().clone();
                if let Some(backend) = backend {
                    if let Err(e) = backend.remove_watch(path, descriptor) {
                        debug!("Removing watch {} for {}: {}", descriptor, path.display(), e);
                    }
                }
            })),
            backend,
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn resources(&self) -> &ResourceTracker {
        &self.resources
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Register a listener and start watching the directories its pattern covers
    ///
    /// Fails with `Pattern` or `PathResolution` before anything is tracked.
    /// If the native watch on the base directory cannot be created the
    /// registration is rolled back and the error returned.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> Result<WatchHandle> {
        let (pattern, base, recursive) = self.compile_listener(listener.path_pattern())?;
        let name_only = is_name_only(listener.path_pattern());
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let dirs = self.initial_directories(&base, recursive);
        let initial_matches = self.enumerate_matches(&pattern, listener.as_ref(), &dirs);

        info!(
            "Registered listener {} for '{}' ({} dir(s), {} existing match(es))",
            id,
            pattern.as_str(),
            dirs.len(),
            initial_matches.len()
        );

        self.listeners.lock().insert(
            id,
            ListenerEntry {
                listener: Arc::clone(&listener),
                pattern,
                base: base.clone(),
                recursive,
                name_only,
                watched: dirs.iter().cloned().collect(),
                initial_matches,
            },
        );

        for dir in &dirs {
            if let Err(e) = self.track(dir, id) {
                let fatal = dir == &base || matches!(e, MonitorError::ResourceExhausted { .. });
                if fatal {
                    if let Err(rollback) = self.unregister_listener(id) {
                        warn!("Listener {}: rollback failed: {}", id, rollback);
                    }
                    return Err(e);
                }
                warn!("Listener {}: not watching {}: {}", id, dir.display(), e);
            }
        }

        Ok(WatchHandle::new(id, listener, self.self_ref.clone()))
    }

    /// Drop a listener and release every path it watched
    pub fn unregister_listener(&self, listener_id: ListenerId) -> Result<()> {
        let entry = self
            .listeners
            .lock()
            .remove(&listener_id)
            .ok_or(MonitorError::WatchNotActive(listener_id))?;

        for path in &entry.watched {
            self.resources.remove_resource(path, listener_id);
        }
        info!("Unregistered listener {}", listener_id);
        Ok(())
    }

    /// Listener IDs whose pattern (and filter) accept `path`
    ///
    /// A bare file-name pattern such as `*.py` is scoped to the project root.
    /// Linear over registered listeners; filters run outside the registry lock.
    pub fn get_matching_listeners(&self, path: &Path) -> Vec<ListenerId> {
        let candidates: Vec<(ListenerId, Arc<dyn Listener>)> = {
            let listeners = self.listeners.lock();
            listeners
                .iter()
                .filter(|(_, entry)| entry.accepts(path))
                .map(|(id, entry)| (*id, Arc::clone(&entry.listener)))
                .collect()
        };

        let mut matched: Vec<ListenerId> = candidates
            .into_iter()
            .filter(|(_, listener)| listener.filter(path))
            .map(|(id, _)| id)
            .collect();
        matched.sort_unstable();
        matched
    }

    pub fn listener(&self, listener_id: ListenerId) -> Option<Arc<dyn Listener>> {
        self.listeners
            .lock()
            .get(&listener_id)
            .map(|entry| Arc::clone(&entry.listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn watched_paths(&self, listener_id: ListenerId) -> HashSet<PathBuf> {
        self.listeners
            .lock()
            .get(&listener_id)
            .map(|entry| entry.watched.clone())
            .unwrap_or_default()
    }

    /// Files that matched at registration time
    pub fn initial_matches(&self, listener_id: ListenerId) -> Vec<PathBuf> {
        self.listeners
            .lock()
            .get(&listener_id)
            .map(|entry| entry.initial_matches.clone())
            .unwrap_or_default()
    }

    /// Whether any listener watches `dir`
    pub fn is_watched(&self, dir: &Path) -> bool {
        self.resources.contains(dir)
    }

    /// Add `path` to a listener's watched set
    ///
    /// Returns `false` if the listener already watched it.
    pub fn add_watch(&self, path: &Path, listener_id: ListenerId) -> Result<bool> {
        {
            let mut listeners = self.listeners.lock();
            let entry = listeners
                .get_mut(&listener_id)
                .ok_or(MonitorError::WatchNotActive(listener_id))?;
            if !entry.watched.insert(path.to_path_buf()) {
                return Ok(false);
            }
        }
        self.track(path, listener_id)?;
        Ok(true)
    }

    /// Remove `path` from a listener's watched set
    ///
    /// Returns `false` if the listener did not watch it.
    pub fn remove_watch(&self, path: &Path, listener_id: ListenerId) -> Result<bool> {
        {
            let mut listeners = self.listeners.lock();
            let entry = listeners
                .get_mut(&listener_id)
                .ok_or(MonitorError::WatchNotActive(listener_id))?;
            if !entry.watched.remove(path) {
                return Ok(false);
            }
        }
        self.resources.remove_resource(path, listener_id);
        Ok(true)
    }

    /// Extend watches after `dir` appeared on disk
    ///
    /// Walks the new subtree and adds every directory some listener wants.
    /// Returns the directories that gained a watch.
    pub fn directory_created(&self, dir: &Path) -> Vec<PathBuf> {
        let mut added = Vec::new();

        for scope in self.scopes() {
            let walker = WalkDir::new(dir)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    e.file_type().is_dir()
                        && !self.ignore.should_ignore(e.path(), true)
                        && (scope.wants(e.path()) || scope.base.starts_with(e.path()))
                });

            for entry in walker.filter_map(|e| e.ok()) {
                let path = entry.path();
                if !scope.wants(path) && path != scope.base {
                    continue;
                }
                match self.add_watch(path, scope.id) {
                    Ok(true) => added.push(path.to_path_buf()),
                    Ok(false) => {}
                    Err(e) => warn!("Listener {}: cannot watch {}: {}", scope.id, path.display(), e),
                }
            }

            // Base just appeared: the ancestor watches have done their job
            if dir.starts_with(&scope.base) || scope.base.starts_with(dir) {
                if scope.base.is_dir() {
                    self.release_ancestors(&scope);
                }
            }
        }

        if !added.is_empty() {
            debug!("Directory {} added {} watch(es)", dir.display(), added.len());
        }
        added.sort();
        added.dedup();
        added
    }

    /// Forget `dir` and everything below it after it left the tree
    ///
    /// A listener left with nothing to watch falls back to the nearest
    /// existing ancestor of its base so it notices the base coming back.
    pub fn directory_removed(&self, dir: &Path) {
        for scope in self.scopes() {
            let doomed: Vec<PathBuf> = self
                .watched_paths(scope.id)
                .into_iter()
                .filter(|p| p.starts_with(dir))
                .collect();
            for path in &doomed {
                self.release(path, scope.id);
            }

            if !doomed.is_empty() && self.watched_paths(scope.id).is_empty() {
                if let Some(anchor) = nearest_existing_dir(&scope.base) {
                    debug!(
                        "Listener {} lost {}; waiting on {}",
                        scope.id,
                        scope.base.display(),
                        anchor.display()
                    );
                    if let Err(e) = self.add_watch(&anchor, scope.id) {
                        warn!("Listener {}: cannot watch {}: {}", scope.id, anchor.display(), e);
                    }
                }
            }
        }
    }

    /// Attach a platform monitor and create native watches for every tracked path
    ///
    /// Returns the number of watches created. Per-path failures are logged.
    pub fn attach_backend(&self, backend: Arc<dyn MonitorBase>) -> usize {
        *self.backend.write() = Some(Arc::clone(&backend));

        let mut created = 0;
        for path in self.resources.paths_without_descriptor() {
            match self.install(backend.as_ref(), &path) {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => warn!("Cannot watch {}: {}", path.display(), e),
            }
        }
        info!("{} monitor watching {} path(s)", backend.name(), created);
        created
    }

    /// Detach the platform monitor after it closed its native handles
    pub fn detach_backend(&self) {
        self.backend.write().take();
        self.resources.clear_descriptors();
    }

    fn scopes(&self) -> Vec<ListenerScope> {
        self.listeners
            .lock()
            .iter()
            .map(|(id, entry)| ListenerScope {
                id: *id,
                base: entry.base.clone(),
                recursive: entry.recursive,
            })
            .collect()
    }

    fn release_ancestors(&self, scope: &ListenerScope) {
        let ancestors: Vec<PathBuf> = self
            .watched_paths(scope.id)
            .into_iter()
            .filter(|p| p != &scope.base && scope.base.starts_with(p))
            .collect();
        for path in ancestors {
            self.release(&path, scope.id);
        }
    }

    /// `remove_watch` for bookkeeping paths, logging instead of failing
    fn release(&self, path: &Path, listener_id: ListenerId) {
        if let Err(e) = self.remove_watch(path, listener_id) {
            warn!("Listener {}: cannot release {}: {}", listener_id, path.display(), e);
        }
    }

    /// Take a reference on `path`, creating the native watch on first use
    fn track(&self, path: &Path, listener_id: ListenerId) -> Result<()> {
        let resource = self.resources.add_resource(path, listener_id);
        if resource.ref_count() > 1 || resource.descriptor.is_some() {
            return Ok(());
        }

        let backend = self.backend.read().clone();
        if let Some(backend) = backend {
            self.install(backend.as_ref(), path)?;
        }
        Ok(())
    }

    fn install(&self, backend: &dyn MonitorBase, path: &Path) -> Result<Option<WatchDescriptor>> {
        let descriptor = backend.add_watch(path)?;
        if self.resources.set_os_descriptor(path, descriptor, None) {
            debug!("Watching {} ({})", path.display(), descriptor);
            Ok(Some(descriptor))
        } else {
            // Released while the watch was being created
            if let Err(e) = backend.remove_watch(path, descriptor) {
                warn!("Cannot drop stale watch {} for {}: {}", descriptor, path.display(), e);
            }
            Ok(None)
        }
    }

    /// Resolve and compile a listener pattern
    ///
    /// Returns the pattern, its base directory and whether subdirectories
    /// are watched.
    fn compile_listener(&self, raw: &str) -> Result<(PathPattern, PathBuf, bool)> {
        if raw.trim().is_empty() {
            return Err(MonitorError::Pattern {
                pattern: raw.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        if is_name_only(raw) {
            let pattern = PathPattern::compile(raw)?;
            return Ok((pattern, self.project_root.clone(), self.recursive));
        }

        let resolved = path::resolve(Path::new(raw), Some(&self.project_root))?;
        let mut text = match_string(&resolved);

        let literal = !text.contains(&['*', '?', '['][..]);
        if literal && resolved.is_dir() {
            let suffix = if self.recursive { "/**" } else { "/*" };
            text = format!("{}{}", text.trim_end_matches('/'), suffix);
        }

        let pattern = PathPattern::compile(&text)?;
        let base = pattern
            .base_directory()
            .unwrap_or_else(|| self.project_root.clone());
        let recursive = self.recursive && pattern.spans_subdirectories();
        Ok((pattern, base, recursive))
    }

    fn initial_directories(&self, base: &Path, recursive: bool) -> Vec<PathBuf> {
        if !base.is_dir() {
            return nearest_existing_dir(base).into_iter().collect();
        }
        let max_depth = if recursive { usize::MAX } else { 0 };
        WalkDir::new(base)
            .follow_links(false)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| e.file_type().is_dir() && !self.ignore.should_ignore(e.path(), true))
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect()
    }

    fn enumerate_matches(
        &self,
        pattern: &PathPattern,
        listener: &dyn Listener,
        dirs: &[PathBuf],
    ) -> Vec<PathBuf> {
        let mut matches = Vec::new();
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir || self.ignore.should_ignore(&path, false) || path::is_log_file(&path) {
                    continue;
                }
                if pattern.matches(&path) && listener.filter(&path) {
                    matches.push(path);
                }
            }
        }
        matches.sort();
        matches
    }
}

/// `*.py`-style patterns without any directory component
fn is_name_only(raw: &str) -> bool {
    !raw.contains('/') && !(cfg!(windows) && raw.contains('\\')) && !raw.starts_with('~')
}

fn nearest_existing_dir(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.is_dir()).map(Path::to_path_buf)
}
