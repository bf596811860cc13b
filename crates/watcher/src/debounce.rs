//! Per-path debouncing
//!
//! Pending events sit in a min-heap keyed by dispatch time. A repeat of the
//! same `(path, event type)` rewrites the pending entry's deadline instead
//! of queueing a duplicate, so a burst of writes becomes one dispatch at
//! `last write + delay`.
//!
//! The heap uses lazy deletion: a rewrite pushes a fresh heap entry with a
//! new generation and the superseded one is skipped when popped.

use crate::error::Result;
use crate::event::{EventType, FileSystemEvent};
use crate::listener::ListenerId;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Receives each event once its debounce window has elapsed
pub type DebounceCallback = Arc<dyn Fn(FileSystemEvent, Vec<ListenerId>) + Send + Sync>;

/// Scheduler wait when nothing is pending
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);

type Key = (PathBuf, EventType);

struct Pending {
    event: FileSystemEvent,
    listener_ids: Vec<ListenerId>,
    generation: u64,
    dispatch_at: Instant,
}

struct HeapEntry {
    dispatch_at: Instant,
    generation: u64,
    key: Key,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dispatch_at == other.dispatch_at && self.generation == other.generation
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.dispatch_at
            .cmp(&other.dispatch_at)
            .then(self.generation.cmp(&other.generation))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending: HashMap<Key, Pending>,
    next_generation: u64,
    running: bool,
}

impl State {
    fn pop_due(&mut self, now: Instant) -> Vec<(FileSystemEvent, Vec<ListenerId>)> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.dispatch_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let current = self
                .pending
                .get(&entry.key)
                .is_some_and(|p| p.generation == entry.generation);
            if current {
                if let Some(pending) = self.pending.remove(&entry.key) {
                    due.push((pending.event, pending.listener_ids));
                }
            }
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.dispatch_at)
    }
}

/// Debounce queue with its own scheduler thread
pub struct EventDebouncer {
    state: Mutex<State>,
    wake: Condvar,
    default_delay_ms: AtomicU64,
    idle_wait: Duration,
    callback: DebounceCallback,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDebouncer {
    pub fn new(default_delay_ms: u64, callback: DebounceCallback) -> Self {
        Self::with_idle_wait(default_delay_ms, DEFAULT_IDLE_WAIT, callback)
    }

    /// Like `new`, with a custom wait granularity for an empty queue
    pub fn with_idle_wait(default_delay_ms: u64, idle_wait: Duration, callback: DebounceCallback) -> Self {
        Self {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            default_delay_ms: AtomicU64::new(default_delay_ms),
            idle_wait,
            callback,
            worker: Mutex::new(None),
        }
    }

    /// Start the scheduler thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.running {
                warn!("Debouncer already running");
                return Ok(());
            }
            state.running = true;
        }

        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("fs-monitor-debounce".to_string())
            .spawn(move || this.run());

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                debug!("Debouncer started");
                Ok(())
            }
            Err(e) => {
                self.state.lock().running = false;
                Err(e.into())
            }
        }
    }

    /// Stop the scheduler, dropping every pending event
    pub fn stop(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let dropped = state.pending.len();
            state.pending.clear();
            state.heap.clear();
            dropped
        };
        self.wake.notify_all();

        if dropped > 0 {
            info!("Debouncer stopped, dropped {} pending event(s)", dropped);
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // Stopping from inside a dispatch callback: the loop exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Debouncer thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Queue `event` for the listeners in `listener_ids`
    ///
    /// The delay is the largest of `listener_delays_ms` and the default. A
    /// pending event with the same path and type has its deadline rewritten
    /// (never earlier than before) and absorbs the listener IDs.
    pub fn add_event(&self, event: FileSystemEvent, listener_ids: &[ListenerId], listener_delays_ms: &[u64]) {
        let delay_ms = listener_delays_ms
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
            .max(self.default_delay_ms());
        let mut dispatch_at = Instant::now() + Duration::from_millis(delay_ms);
        let key = event.debounce_key();

        {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;

            match state.pending.get_mut(&key) {
                Some(pending) => {
                    trace!("Collapsing {} (deadline pushed by {}ms)", event, delay_ms);
                    dispatch_at = dispatch_at.max(pending.dispatch_at);
                    pending.generation = generation;
                    pending.dispatch_at = dispatch_at;
                    pending.event = event;
                    for id in listener_ids {
                        if !pending.listener_ids.contains(id) {
                            pending.listener_ids.push(*id);
                        }
                    }
                }
                None => {
                    state.pending.insert(
                        key.clone(),
                        Pending {
                            event,
                            listener_ids: listener_ids.to_vec(),
                            generation,
                            dispatch_at,
                        },
                    );
                }
            }

            state.heap.push(Reverse(HeapEntry {
                dispatch_at,
                generation,
                key,
            }));
        }

        self.wake.notify_one();
    }

    pub fn default_delay_ms(&self) -> u64 {
        self.default_delay_ms.load(Ordering::Relaxed)
    }

    pub fn set_default_delay_ms(&self, delay_ms: u64) {
        self.default_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    /// Events waiting for their deadline
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Pop everything due at `now` without invoking the callback
    pub(crate) fn take_due(&self, now: Instant) -> Vec<(FileSystemEvent, Vec<ListenerId>)> {
        self.state.lock().pop_due(now)
    }

    fn run(&self) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    if !state.running {
                        return;
                    }
                    let due = state.pop_due(Instant::now());
                    if !due.is_empty() {
                        break due;
                    }
                    match state.next_deadline() {
                        Some(deadline) => {
                            self.wake.wait_until(&mut state, deadline);
                        }
                        None => {
                            self.wake.wait_for(&mut state, self.idle_wait);
                        }
                    }
                }
            };

            for (event, listener_ids) in due {
                let callback = Arc::clone(&self.callback);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| (*callback)(event, listener_ids)));
                if outcome.is_err() {
                    error!("Debounce dispatch callback panicked");
                }
            }
        }
    }
}

impl Drop for EventDebouncer {
    fn drop(&mut self) {
        self.state.get_mut().running = false;
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    type Delivery = (FileSystemEvent, Vec<ListenerId>, Instant);

    fn debouncer(default_ms: u64) -> (Arc<EventDebouncer>, Receiver<Delivery>) {
        let (tx, rx) = unbounded();
        let callback: DebounceCallback = Arc::new(move |event: FileSystemEvent, ids: Vec<ListenerId>| {
            let _ = tx.send((event, ids, Instant::now()));
        });
        let debouncer = Arc::new(EventDebouncer::with_idle_wait(
            default_ms,
            Duration::from_millis(10),
            callback,
        ));
        (debouncer, rx)
    }

    fn modified(path: &str) -> FileSystemEvent {
        FileSystemEvent::new(EventType::FileModified, path)
    }

    #[test]
    fn test_burst_collapses_to_one_dispatch() {
        let (debouncer, rx) = debouncer(0);
        debouncer.start().unwrap();

        let ids = [ListenerId(1)];
        for _ in 0..3 {
            debouncer.add_event(modified("/p/a.py"), &ids, &[50]);
            thread::sleep(Duration::from_millis(3));
        }
        let last_write = Instant::now();

        let (event, listeners, at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.path(), std::path::Path::new("/p/a.py"));
        assert_eq!(listeners, vec![ListenerId(1)]);
        assert!(at.duration_since(last_write) >= Duration::from_millis(45));

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        debouncer.stop();
    }

    #[test]
    fn test_different_types_are_not_collapsed() {
        let (debouncer, _rx) = debouncer(0);
        let ids = [ListenerId(1)];
        debouncer.add_event(FileSystemEvent::new(EventType::FileCreated, "/p/a"), &ids, &[0]);
        debouncer.add_event(modified("/p/a"), &ids, &[0]);
        debouncer.add_event(modified("/p/b"), &ids, &[0]);
        assert_eq!(debouncer.pending_count(), 3);

        let due = debouncer.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due.len(), 3);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn test_collapse_merges_listeners_and_rewrites_deadline() {
        let (debouncer, _rx) = debouncer(0);
        debouncer.add_event(modified("/p/a"), &[ListenerId(1)], &[10]);
        debouncer.add_event(modified("/p/a"), &[ListenerId(2), ListenerId(1)], &[500]);
        assert_eq!(debouncer.pending_count(), 1);

        // The first deadline has been superseded
        assert!(debouncer
            .take_due(Instant::now() + Duration::from_millis(100))
            .is_empty());

        let due = debouncer.take_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, vec![ListenerId(1), ListenerId(2)]);
    }

    #[test]
    fn test_shorter_repeat_keeps_later_deadline() {
        let (debouncer, _rx) = debouncer(0);
        debouncer.add_event(modified("/p/a"), &[ListenerId(1)], &[500]);
        debouncer.add_event(modified("/p/a"), &[ListenerId(2)], &[10]);

        assert!(debouncer
            .take_due(Instant::now() + Duration::from_millis(100))
            .is_empty());
        let due = debouncer.take_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, vec![ListenerId(1), ListenerId(2)]);
    }

    #[test]
    fn test_listener_delay_beats_smaller_default() {
        let (debouncer, rx) = debouncer(10);
        debouncer.start().unwrap();
        let queued = Instant::now();
        debouncer.add_event(modified("/p/slow"), &[ListenerId(1)], &[120]);

        let (_, _, at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(at.duration_since(queued) >= Duration::from_millis(115));
        debouncer.stop();
    }

    #[test]
    fn test_default_applies_when_larger() {
        let (debouncer, _rx) = debouncer(300);
        debouncer.add_event(modified("/p/a"), &[ListenerId(1)], &[5]);
        assert!(debouncer
            .take_due(Instant::now() + Duration::from_millis(100))
            .is_empty());

        debouncer.set_default_delay_ms(0);
        assert_eq!(debouncer.default_delay_ms(), 0);
    }

    #[test]
    fn test_stop_drops_pending_events() {
        let (debouncer, rx) = debouncer(0);
        debouncer.start().unwrap();
        debouncer.add_event(modified("/p/a"), &[ListenerId(1)], &[300]);
        assert_eq!(debouncer.pending_count(), 1);

        debouncer.stop();
        assert!(!debouncer.is_running());
        assert_eq!(debouncer.pending_count(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_restart_after_stop() {
        let (debouncer, rx) = debouncer(0);
        debouncer.start().unwrap();
        debouncer.start().unwrap();
        debouncer.stop();
        debouncer.stop();

        debouncer.start().unwrap();
        debouncer.add_event(modified("/p/again"), &[ListenerId(1)], &[0]);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        debouncer.stop();
    }

    #[test]
    fn test_panicking_callback_keeps_scheduler_alive() {
        let (tx, rx) = unbounded();
        let callback: DebounceCallback = Arc::new(move |event: FileSystemEvent, _ids: Vec<ListenerId>| {
            if event.path().ends_with("boom") {
                panic!("callback failure");
            }
            let _ = tx.send(event);
        });
        let debouncer = Arc::new(EventDebouncer::new(0, callback));
        debouncer.start().unwrap();

        debouncer.add_event(modified("/p/boom"), &[ListenerId(1)], &[0]);
        thread::sleep(Duration::from_millis(50));
        debouncer.add_event(modified("/p/fine"), &[ListenerId(1)], &[0]);

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(event.path().ends_with("fine"));
        debouncer.stop();
    }
}
