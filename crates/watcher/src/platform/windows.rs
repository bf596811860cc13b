//! Windows `ReadDirectoryChangesW` monitor
//!
//! One thread per watched root issues overlapped subtree reads and waits on
//! the read's completion event plus a per-root stop event. A directory below
//! a live root joins that root instead of opening its own handle, and a new
//! root above existing ones absorbs them. Records whose parent directory is
//! not tracked by the watch manager are skipped, so ignored directories and
//! the subdirectories of non-recursive listeners stay silent.
//!
//! `FILE_ACTION_RENAMED_OLD_NAME` immediately followed by
//! `FILE_ACTION_RENAMED_NEW_NAME` is reported as one correlated rename.

use super::{MonitorBase, MonitorContext, SymlinkTable};
use crate::error::{MonitorError, Result};
use crate::resource::WatchDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED,
    FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_SIZE;

/// Notification buffer, in `u32` units for DWORD alignment
const BUFFER_WORDS: usize = 16 * 1024;

const WAIT_FOREVER: u32 = u32::MAX;

/// Owned Win32 handle
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn event() -> io::Result<Self> {
        // Manual reset, initially unsignaled
        let handle = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    fn open_directory(path: &Path) -> io::Result<Self> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Byte offset of `FileName` in `FILE_NOTIFY_INFORMATION`
const NOTIFY_HEADER: usize = 12;

/// Decode the chained `FILE_NOTIFY_INFORMATION` records in `buffer`
fn parse_notifications(buffer: &[u8]) -> Vec<(u32, PathBuf)> {
    let field = |at: usize| u32::from_ne_bytes([buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]]);
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + NOTIFY_HEADER <= buffer.len() {
        let next_entry = field(offset) as usize;
        let action = field(offset + 4);
        let name_len = field(offset + 8) as usize;

        let name_start = offset + NOTIFY_HEADER;
        let name_end = name_start + name_len;
        if name_end > buffer.len() {
            break;
        }

        let wide: Vec<u16> = buffer[name_start..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        records.push((action, PathBuf::from(OsString::from_wide(&wide))));

        if next_entry == 0 {
            break;
        }
        offset += next_entry;
    }

    records
}

/// Roots and the watch descriptors riding on each of them
struct RootTable<R> {
    roots: HashMap<PathBuf, Root<R>>,
    members: HashMap<WatchDescriptor, PathBuf>,
}

struct Root<R> {
    reader: R,
    members: usize,
}

impl<R> Default for RootTable<R> {
    fn default() -> Self {
        Self {
            roots: HashMap::new(),
            members: HashMap::new(),
        }
    }
}

impl<R> RootTable<R> {
    /// Attach `descriptor` to a live root covering `path`
    fn join_existing(&mut self, path: &Path, descriptor: WatchDescriptor, is_live: impl Fn(&R) -> bool) -> bool {
        let covering = self
            .roots
            .iter()
            .filter(|(root, entry)| path.starts_with(root) && is_live(&entry.reader))
            .map(|(root, _)| root.clone())
            .min_by_key(|root| root.components().count());

        let Some(root) = covering else {
            return false;
        };
        if let Some(entry) = self.roots.get_mut(&root) {
            entry.members += 1;
        }
        self.members.insert(descriptor, root);
        true
    }

    /// Make `path` a root, absorbing roots below it and dead ones
    ///
    /// Returns the readers that were replaced.
    fn insert_root(
        &mut self,
        path: &Path,
        descriptor: WatchDescriptor,
        reader: R,
        is_live: impl Fn(&R) -> bool,
    ) -> Vec<R> {
        let absorbed: Vec<PathBuf> = self
            .roots
            .iter()
            .filter(|(root, entry)| root.starts_with(path) || !is_live(&entry.reader))
            .map(|(root, _)| root.clone())
            .collect();

        let mut members = 1;
        let mut retired = Vec::with_capacity(absorbed.len());
        for root in absorbed {
            let Some(entry) = self.roots.remove(&root) else {
                continue;
            };
            if root.starts_with(path) {
                members += entry.members;
                for owner in self.members.values_mut().filter(|owner| **owner == root) {
                    *owner = path.to_path_buf();
                }
            } else {
                // Dead root elsewhere: its descriptors have nothing left to watch them
                self.members.retain(|_, owner| *owner != root);
            }
            retired.push(entry.reader);
        }

        self.members.insert(descriptor, path.to_path_buf());
        self.roots.insert(path.to_path_buf(), Root { reader, members });
        retired
    }

    /// Detach `descriptor`; returns its root's reader once nothing rides on it
    fn remove(&mut self, descriptor: WatchDescriptor) -> Option<R> {
        let root = self.members.remove(&descriptor)?;
        let entry = self.roots.get_mut(&root)?;
        entry.members = entry.members.saturating_sub(1);
        if entry.members > 0 {
            return None;
        }
        self.roots.remove(&root).map(|entry| entry.reader)
    }

    fn drain(&mut self) -> Vec<R> {
        self.members.clear();
        self.roots.drain().map(|(_, entry)| entry.reader).collect()
    }

    fn root_count(&self) -> usize {
        self.roots.len()
    }
}

struct RootWatch {
    stop_event: Arc<OwnedHandle>,
    alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RootWatch {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn signal(&self) {
        unsafe { SetEvent(self.stop_event.0) };
    }
}

#[derive(Default)]
struct State {
    table: RootTable<RootWatch>,
    // Signalled readers, joined on stop
    retired: Vec<JoinHandle<()>>,
}

impl State {
    fn retire(&mut self, watch: RootWatch) {
        watch.signal();
        self.retired.push(watch.thread);
    }
}

/// Subtree `ReadDirectoryChangesW` monitor, one reader thread per root
pub struct WindowsMonitor {
    ctx: MonitorContext,
    symlinks: Arc<SymlinkTable>,
    state: Mutex<State>,
    next_descriptor: AtomicI64,
    running: AtomicBool,
}

impl WindowsMonitor {
    pub fn new(ctx: MonitorContext) -> Self {
        Self {
            ctx,
            symlinks: Arc::new(SymlinkTable::default()),
            state: Mutex::new(State::default()),
            next_descriptor: AtomicI64::new(1),
            running: AtomicBool::new(false),
        }
    }

    /// Reader threads currently serving watches
    pub fn root_count(&self) -> usize {
        self.state.lock().table.root_count()
    }

    fn spawn_root(&self, path: &Path, descriptor: WatchDescriptor) -> Result<RootWatch> {
        let directory = OwnedHandle::open_directory(path).map_err(|e| MonitorError::from_watch_failure(path, e))?;
        let stop_event = Arc::new(OwnedHandle::event()?);
        let alive = Arc::new(AtomicBool::new(true));

        let mut reader = RootReader {
            root: path.to_path_buf(),
            directory,
            stop_event: Arc::clone(&stop_event),
            alive: Arc::clone(&alive),
            ctx: self.ctx.clone(),
            symlinks: Arc::clone(&self.symlinks),
            pending_old: None,
        };
        let thread = thread::Builder::new()
            .name(format!("fs-monitor-rdcw-{}", descriptor.0))
            .spawn(move || reader.run())?;

        Ok(RootWatch {
            stop_event,
            alive,
            thread,
        })
    }
}

impl MonitorBase for WindowsMonitor {
    fn name(&self) -> &'static str {
        "ReadDirectoryChangesW"
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Windows monitor already running");
        } else {
            info!("Windows monitor started");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let threads: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            let readers = state.table.drain();
            for reader in readers {
                state.retire(reader);
            }
            state.retired.drain(..).collect()
        };

        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() != current && thread.join().is_err() {
                error!("Directory watch thread panicked");
            }
        }
        self.symlinks.clear();
        info!("Windows monitor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn add_watch(&self, path: &Path) -> Result<WatchDescriptor> {
        if !self.is_running() {
            return Err(MonitorError::NotRunning("Windows monitor"));
        }

        let descriptor = WatchDescriptor(self.next_descriptor.fetch_add(1, Ordering::SeqCst));
        self.symlinks.seed(path);

        let mut state = self.state.lock();
        if state.table.join_existing(path, descriptor, RootWatch::is_live) {
            trace!("Watching {} ({}) through an existing root", path.display(), descriptor);
            return Ok(descriptor);
        }

        let watch = self.spawn_root(path, descriptor)?;
        let replaced = state.table.insert_root(path, descriptor, watch, RootWatch::is_live);
        if !replaced.is_empty() {
            debug!("Root {} absorbed {} reader(s)", path.display(), replaced.len());
        }
        for reader in replaced {
            state.retire(reader);
        }
        trace!("Watching {} ({}) as a root", path.display(), descriptor);
        Ok(descriptor)
    }

    fn remove_watch(&self, path: &Path, descriptor: WatchDescriptor) -> Result<()> {
        // Not joined here: the reader may be the caller, reporting its own removal
        let mut state = self.state.lock();
        if let Some(reader) = state.table.remove(descriptor) {
            state.retire(reader);
            trace!("Released root {} ({})", path.display(), descriptor);
        }
        Ok(())
    }
}

impl Drop for WindowsMonitor {
    fn drop(&mut self) {
        let _ = MonitorBase::stop(self);
    }
}

struct RootReader {
    root: PathBuf,
    directory: OwnedHandle,
    stop_event: Arc<OwnedHandle>,
    alive: Arc<AtomicBool>,
    ctx: MonitorContext,
    symlinks: Arc<SymlinkTable>,
    pending_old: Option<PathBuf>,
}

impl RootReader {
    fn run(&mut self) {
        let stopped = self.read_loop();
        self.alive.store(false, Ordering::SeqCst);
        self.flush_rename();

        // The root itself went away; inside the tree its parent reports it
        if !stopped && !self.root.exists() {
            let parent_watched = self.root.parent().is_some_and(|p| self.ctx.is_watched_dir(p));
            if !parent_watched && self.ctx.is_watched_dir(&self.root) {
                self.ctx.report_removed(&self.root, true, &self.symlinks, None);
            }
        }
        debug!("Stopped watching {}", self.root.display());
    }

    /// Returns `true` when the stop event ended the loop
    fn read_loop(&mut self) -> bool {
        let completion = match OwnedHandle::event() {
            Ok(event) => event,
            Err(e) => {
                error!("CreateEventW failed for {}: {}", self.root.display(), e);
                return false;
            }
        };
        let mut buffer = vec![0u32; BUFFER_WORDS];
        let buffer_bytes = (BUFFER_WORDS * mem::size_of::<u32>()) as u32;

        loop {
            let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
            overlapped.hEvent = completion.0;

            let issued = unsafe {
                ReadDirectoryChangesW(
                    self.directory.0,
                    buffer.as_mut_ptr() as *mut _,
                    buffer_bytes,
                    1,
                    NOTIFY_FILTER,
                    ptr::null_mut(),
                    &mut overlapped,
                    None,
                )
            };
            if issued == 0 {
                // Typically the root itself was deleted
                debug!(
                    "ReadDirectoryChangesW stopped for {}: {}",
                    self.root.display(),
                    io::Error::last_os_error()
                );
                return false;
            }

            let handles = [completion.0, self.stop_event.0];
            let wait = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, WAIT_FOREVER) };

            if wait != WAIT_OBJECT_0 {
                // Stop requested (or the wait failed): cancel the read and let it drain
                unsafe {
                    CancelIoEx(self.directory.0, &overlapped);
                    let mut transferred = 0u32;
                    GetOverlappedResult(self.directory.0, &overlapped, &mut transferred, 1);
                }
                return true;
            }

            let mut transferred = 0u32;
            let ok = unsafe { GetOverlappedResult(self.directory.0, &overlapped, &mut transferred, 0) };
            if ok == 0 {
                error!(
                    "Reading changes for {} failed: {}",
                    self.root.display(),
                    io::Error::last_os_error()
                );
                return false;
            }
            if transferred == 0 {
                warn!("Change buffer overflowed for {}, events were lost", self.root.display());
                continue;
            }

            let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr() as *const u8, transferred as usize) };
            for (action, name) in parse_notifications(bytes) {
                self.handle(action, self.root.join(name));
            }
            self.flush_rename();
        }
    }

    /// Whether the watch manager tracks the directory holding `path`
    fn in_scope(&self, path: &Path) -> bool {
        path.parent().is_some_and(|p| self.ctx.is_watched_dir(p))
    }

    fn handle(&mut self, action: u32, path: PathBuf) {
        trace!("RDCW action {} {}", action, path.display());

        if action != FILE_ACTION_RENAMED_NEW_NAME {
            self.flush_rename();
        }
        if !self.in_scope(&path) {
            // A rename out of the tracked set is a removal
            if action == FILE_ACTION_RENAMED_NEW_NAME {
                self.flush_rename();
            }
            return;
        }

        match action {
            FILE_ACTION_ADDED => self.ctx.report_created(&path, &self.symlinks, None),
            FILE_ACTION_REMOVED => self.ctx.report_removed(&path, false, &self.symlinks, None),
            FILE_ACTION_MODIFIED => {
                // Directory timestamps change with their contents
                let is_dir = std::fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
                if !is_dir {
                    self.ctx.report_modified(&path, &self.symlinks);
                }
            }
            FILE_ACTION_RENAMED_OLD_NAME => self.pending_old = Some(path),
            FILE_ACTION_RENAMED_NEW_NAME => match self.pending_old.take() {
                Some(old) => {
                    let is_dir = self.ctx.is_watched_dir(&old);
                    self.ctx.report_rename(&old, &path, is_dir, &self.symlinks);
                }
                None => self.ctx.report_created(&path, &self.symlinks, None),
            },
            other => trace!("Unhandled RDCW action {}", other),
        }
    }

    /// An old name without its new name moved out of the tracked set
    fn flush_rename(&mut self) {
        if let Some(old) = self.pending_old.take() {
            self.ctx.report_removed(&old, false, &self.symlinks, None);
        }
    }
}
