//! Linux inotify monitor
//!
//! Talks to inotify through raw syscalls. One reader thread waits on the
//! descriptor with `poll(2)` and a timeout so it can notice shutdown, then
//! parses the kernel's packed `inotify_event` records.
//!
//! Renames arrive as `IN_MOVED_FROM` + `IN_MOVED_TO` sharing a cookie. A
//! `MOVED_FROM` is held briefly waiting for its partner: paired, it becomes a
//! correlated delete/create; alone, a `MOVED_TO` is a creation and a
//! `MOVED_FROM` a deletion.

use super::{MonitorBase, MonitorContext, SymlinkTable};
use crate::error::{MonitorError, Result};
use crate::resource::WatchDescriptor;
use parking_lot::Mutex;
use std::ffi::{CString, OsStr};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_DELETE_SELF
    | libc::IN_MOVE_SELF
    | libc::IN_ONLYDIR
    | libc::IN_DONT_FOLLOW
    | libc::IN_EXCL_UNLINK;

const BUFFER_SIZE: usize = 64 * 1024;

/// Poll timeout while idle; bounds how long `stop()` waits for the reader
const POLL_TIMEOUT_MS: i32 = 100;

/// How long an unpaired `IN_MOVED_FROM` waits for its `IN_MOVED_TO`
const RENAME_WINDOW: Duration = Duration::from_millis(50);

/// Owned inotify instance
struct InotifyFd(RawFd);

impl InotifyFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(fd))
    }

    fn add_watch(&self, path: &Path, mask: u32) -> io::Result<i32> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let wd = unsafe { libc::inotify_add_watch(self.0, c_path.as_ptr(), mask) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(wd)
    }

    fn rm_watch(&self, wd: i32) -> io::Result<()> {
        let res = unsafe { libc::inotify_rm_watch(self.0, wd) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait until readable; `Ok(false)` on timeout
    fn wait_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.0,
            events: libc::POLLIN,
            revents: 0,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(res > 0 && pfd.revents & libc::POLLIN != 0)
    }

    fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let res = unsafe { libc::read(self.0, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }
}

impl Drop for InotifyFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// One decoded kernel record
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEvent {
    wd: i32,
    mask: u32,
    cookie: u32,
    name: Option<PathBuf>,
}

impl RawEvent {
    fn has(&self, flag: u32) -> bool {
        self.mask & flag != 0
    }
}

/// Decode the packed records in `buffer`
///
/// A truncated trailing record is dropped.
fn parse_events(buffer: &[u8]) -> Vec<RawEvent> {
    let header = mem::size_of::<libc::inotify_event>();
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + header <= buffer.len() {
        // Records are packed back to back; read the header without assuming alignment
        let raw: libc::inotify_event =
            unsafe { ptr::read_unaligned(buffer.as_ptr().add(offset) as *const libc::inotify_event) };
        let name_start = offset + header;
        let name_end = name_start + raw.len as usize;
        if name_end > buffer.len() {
            break;
        }

        let name_bytes = &buffer[name_start..name_end];
        let name_len = name_bytes.iter().position(|b| *b == 0).unwrap_or(name_bytes.len());
        let name = (name_len > 0).then(|| PathBuf::from(OsStr::from_bytes(&name_bytes[..name_len])));

        events.push(RawEvent {
            wd: raw.wd,
            mask: raw.mask,
            cookie: raw.cookie,
            name,
        });
        offset = name_end;
    }

    events
}

struct PendingMove {
    cookie: u32,
    path: PathBuf,
    is_dir: bool,
    seen: Instant,
}

struct Running {
    fd: Arc<InotifyFd>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// inotify-backed monitor
pub struct InotifyMonitor {
    ctx: MonitorContext,
    symlinks: Arc<SymlinkTable>,
    overflows: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl InotifyMonitor {
    pub fn new(ctx: MonitorContext) -> Self {
        Self {
            ctx,
            symlinks: Arc::new(SymlinkTable::default()),
            overflows: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Kernel queue overflows seen since creation
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn fd(&self) -> Option<Arc<InotifyFd>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.fd))
    }
}

impl MonitorBase for InotifyMonitor {
    fn name(&self) -> &'static str {
        "inotify"
    }

    fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("inotify monitor already running");
            return Ok(());
        }

        // No fallback: without inotify the monitor cannot work on Linux
        let fd = Arc::new(InotifyFd::new().map_err(|e| {
            error!("inotify_init1 failed: {}", e);
            MonitorError::Io(e)
        })?);
        let stop = Arc::new(AtomicBool::new(false));

        let mut reader = Reader {
            fd: Arc::clone(&fd),
            ctx: self.ctx.clone(),
            symlinks: Arc::clone(&self.symlinks),
            overflows: Arc::clone(&self.overflows),
            stop: Arc::clone(&stop),
            pending: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("fs-monitor-inotify".to_string())
            .spawn(move || reader.run())?;

        *running = Some(Running { fd, stop, thread });
        info!("inotify monitor started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        // Released before joining: the reader may be calling add_watch
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.stop.store(true, Ordering::SeqCst);
        if running.thread.join().is_err() {
            error!("inotify reader thread panicked");
        }
        drop(running.fd);
        self.symlinks.clear();
        info!("inotify monitor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn add_watch(&self, path: &Path) -> Result<WatchDescriptor> {
        let fd = self.fd().ok_or(MonitorError::NotRunning("inotify monitor"))?;
        let wd = fd
            .add_watch(path, WATCH_MASK)
            .map_err(|e| MonitorError::from_watch_failure(path, e))?;
        self.symlinks.seed(path);
        trace!("inotify_add_watch {} -> {}", path.display(), wd);
        Ok(WatchDescriptor(i64::from(wd)))
    }

    fn remove_watch(&self, path: &Path, descriptor: WatchDescriptor) -> Result<()> {
        // Closing the instance already dropped every watch
        let Some(fd) = self.fd() else {
            return Ok(());
        };
        let wd = i32::try_from(descriptor.0).map_err(|_| {
            MonitorError::Config(format!("invalid inotify descriptor {}", descriptor))
        })?;

        match fd.rm_watch(wd) {
            Ok(()) => {
                trace!("inotify_rm_watch {} ({})", path.display(), descriptor);
                Ok(())
            }
            // The kernel removes watches on deleted directories by itself
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for InotifyMonitor {
    fn drop(&mut self) {
        let _ = MonitorBase::stop(self);
    }
}

struct Reader {
    fd: Arc<InotifyFd>,
    ctx: MonitorContext,
    symlinks: Arc<SymlinkTable>,
    overflows: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    pending: Vec<PendingMove>,
}

impl Reader {
    fn run(&mut self) {
        let mut buffer = vec![0u8; BUFFER_SIZE];

        while !self.stop.load(Ordering::SeqCst) {
            let timeout = if self.pending.is_empty() {
                POLL_TIMEOUT_MS
            } else {
                RENAME_WINDOW.as_millis() as i32
            };

            match self.fd.wait_readable(timeout) {
                Ok(true) => {}
                Ok(false) => {
                    self.flush_moves(Instant::now());
                    continue;
                }
                Err(e) => {
                    error!("poll on inotify descriptor failed: {}", e);
                    thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
                    continue;
                }
            }

            let len = match self.fd.read(&mut buffer) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Reading inotify events failed: {}", e);
                    continue;
                }
            };

            for event in parse_events(&buffer[..len]) {
                self.handle(event);
            }
            self.flush_moves(Instant::now());
        }

        // Moves still waiting for a partner left the tree
        self.flush_moves(Instant::now() + RENAME_WINDOW);
        debug!("inotify reader exiting");
    }

    fn handle(&mut self, event: RawEvent) {
        if event.has(libc::IN_Q_OVERFLOW) {
            let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("inotify queue overflowed, events were lost ({} overflow(s) so far)", total);
            return;
        }

        let Some(dir) = self.ctx.path_for_descriptor(WatchDescriptor(i64::from(event.wd))) else {
            trace!("Event for released watch {} (mask {:#x})", event.wd, event.mask);
            return;
        };
        let path = match &event.name {
            Some(name) => dir.join(name),
            None => dir.clone(),
        };
        let is_dir = event.has(libc::IN_ISDIR);
        trace!("inotify {:#010x} {}", event.mask, path.display());

        if event.has(libc::IN_IGNORED) {
            // Watch gone on the kernel side: directory deleted or unmounted
            self.ctx.directory_removed(&dir);
            return;
        }

        if event.has(libc::IN_DELETE_SELF) || event.has(libc::IN_MOVE_SELF) {
            // Inside the tree the parent's DELETE/MOVED_FROM reports it
            let parent_watched = dir.parent().is_some_and(|p| self.ctx.is_watched_dir(p));
            if !parent_watched {
                self.ctx.report_removed(&dir, true, &self.symlinks, None);
            }
            return;
        }

        if event.has(libc::IN_MOVED_FROM) {
            self.pending.push(PendingMove {
                cookie: event.cookie,
                path,
                is_dir,
                seen: Instant::now(),
            });
            return;
        }

        if event.has(libc::IN_MOVED_TO) {
            let partner = self
                .pending
                .iter()
                .position(|p| p.cookie == event.cookie && event.cookie != 0);
            match partner {
                Some(index) => {
                    let from = self.pending.remove(index);
                    self.ctx.report_rename(&from.path, &path, is_dir || from.is_dir, &self.symlinks);
                }
                None => self.ctx.report_created(&path, &self.symlinks, None),
            }
            return;
        }

        if event.has(libc::IN_CREATE) {
            self.ctx.report_created(&path, &self.symlinks, None);
        } else if event.has(libc::IN_DELETE) {
            self.ctx.report_removed(&path, is_dir, &self.symlinks, None);
        } else if event.has(libc::IN_MODIFY) && !is_dir {
            self.ctx.report_modified(&path, &self.symlinks);
        }
    }

    /// Turn moves older than the rename window into deletions
    fn flush_moves(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }
        let (expired, waiting): (Vec<PendingMove>, Vec<PendingMove>) = self
            .pending
            .drain(..)
            .partition(|p| now.duration_since(p.seen) >= RENAME_WINDOW);
        self.pending = waiting;

        for moved in expired {
            trace!("Unpaired move of {}, treating as deletion", moved.path.display());
            self.ctx.report_removed(&moved.path, moved.is_dir, &self.symlinks, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::event::{EventType, FileSystemEvent};
    use crate::listener::{Listener, ListenerId};
    use crate::monitor::FileSystemMonitor;
    use crate::path::match_string;
    use crossbeam_channel::{unbounded, Receiver};
    use std::fs;
    use tempfile::TempDir;

    fn record(wd: i32, mask: u32, cookie: u32, name: &str) -> Vec<u8> {
        let mut padded = name.as_bytes().to_vec();
        if !padded.is_empty() {
            padded.push(0);
            while padded.len() % 4 != 0 {
                padded.push(0);
            }
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&wd.to_ne_bytes());
        bytes.extend_from_slice(&mask.to_ne_bytes());
        bytes.extend_from_slice(&cookie.to_ne_bytes());
        bytes.extend_from_slice(&(padded.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&padded);
        bytes
    }

    #[test]
    fn test_parse_packed_records() {
        let mut buffer = record(1, libc::IN_MOVED_FROM, 7, "old.txt");
        buffer.extend(record(1, libc::IN_MOVED_TO, 7, "new.txt"));
        buffer.extend(record(2, libc::IN_DELETE_SELF, 0, ""));

        let events = parse_events(&buffer);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name, Some(PathBuf::from("old.txt")));
        assert_eq!(events[1].cookie, 7);
        assert!(events[1].has(libc::IN_MOVED_TO));
        assert_eq!(events[2].wd, 2);
        assert_eq!(events[2].name, None);
    }

    #[test]
    fn test_parse_drops_truncated_tail() {
        let mut buffer = record(1, libc::IN_CREATE, 0, "a");
        let second = record(1, libc::IN_CREATE, 0, "bbbbbbbb");
        buffer.extend_from_slice(&second[..second.len() - 3]);
        assert_eq!(parse_events(&buffer).len(), 1);
    }

    struct Quiet(String);

    impl Listener for Quiet {
        fn path_pattern(&self) -> &str {
            &self.0
        }
    }

    fn observed(root: &Path) -> (FileSystemMonitor, Receiver<FileSystemEvent>) {
        let config = MonitorConfig {
            default_debounce_ms: 0,
            thread_count: 1,
            ..MonitorConfig::default()
        };
        let monitor = FileSystemMonitor::new(config, root).unwrap();
        monitor
            .register_listener(Arc::new(Quiet(format!("{}/**", match_string(root)))))
            .unwrap();

        let (tx, rx) = unbounded();
        monitor.subscribe(
            "test",
            Arc::new(move |event: &FileSystemEvent, _ids: &[ListenerId]| {
                let _ = tx.send(event.clone());
            }),
        );
        monitor.start().unwrap();
        (monitor, rx)
    }

    fn next(rx: &Receiver<FileSystemEvent>) -> FileSystemEvent {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_rename_is_reported_as_correlated_pair() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("old.txt"), b"content").unwrap();
        let (monitor, rx) = observed(root);

        fs::rename(root.join("old.txt"), root.join("new.txt")).unwrap();

        let mut events = vec![next(&rx), next(&rx)];
        events.sort_by_key(|e| e.event_type());
        assert_eq!(events[0].event_type(), EventType::FileCreated);
        assert_eq!(events[0].path(), root.join("new.txt"));
        assert_eq!(events[0].rename_counterpart(), Some(root.join("old.txt").as_path()));
        assert_eq!(events[1].event_type(), EventType::FileDeleted);
        assert_eq!(events[1].path(), root.join("old.txt"));
        assert_eq!(events[1].rename_counterpart(), Some(root.join("new.txt").as_path()));

        monitor.stop().unwrap();
    }

    #[test]
    fn test_move_out_of_tree_is_deletion() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("leaving.txt"), b"x").unwrap();
        let (monitor, rx) = observed(root);

        fs::rename(root.join("leaving.txt"), outside.path().join("leaving.txt")).unwrap();

        let event = next(&rx);
        assert_eq!(event.event_type(), EventType::FileDeleted);
        assert_eq!(event.path(), root.join("leaving.txt"));
        assert!(event.rename_counterpart().is_none());
        monitor.stop().unwrap();
    }

    #[test]
    fn test_symlink_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let (monitor, rx) = observed(root);
        let link = root.join("current");

        std::os::unix::fs::symlink("v1", &link).unwrap();
        let created = next(&rx);
        assert_eq!(created.event_type(), EventType::SymlinkCreated);
        assert_eq!(created.new_target(), Some(Path::new("v1")));

        fs::remove_file(&link).unwrap();
        let deleted = next(&rx);
        assert_eq!(deleted.event_type(), EventType::SymlinkDeleted);
        assert_eq!(deleted.path(), link);
        monitor.stop().unwrap();
    }
}
