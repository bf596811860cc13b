//! Event dispatcher
//!
//! Glue between detection and delivery: raw events are matched against the
//! watch manager, parked in the debouncer, and finally handed to listener
//! callbacks on the thread pool.

use crate::config::MonitorConfig;
use crate::debounce::{DebounceCallback, EventDebouncer};
use crate::error::Result;
use crate::event::{EventType, FileSystemEvent};
use crate::listener::{Listener, ListenerId};
use crate::thread_pool::{panic_message, ThreadManager};
use crate::watch_manager::WatchManager;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Callback notified of every debounced event before listener delivery
pub type ObserverFn = Arc<dyn Fn(&FileSystemEvent, &[ListenerId]) + Send + Sync>;

/// Token returned by [`EventDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Counters since the dispatcher was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events handed to `dispatch_event`
    pub received: u64,
    /// Events no listener matched
    pub dropped_unmatched: u64,
    /// Listener deliveries submitted after debouncing
    pub dispatched: u64,
    /// Callbacks that returned an error or panicked
    pub listener_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped_unmatched: AtomicU64,
    dispatched: AtomicU64,
    listener_failures: AtomicU64,
}

struct Observer {
    id: ObserverId,
    tag: String,
    callback: ObserverFn,
}

pub struct EventDispatcher {
    watch_manager: Arc<WatchManager>,
    debouncer: Arc<EventDebouncer>,
    threads: ThreadManager,
    running: AtomicBool,
    transition: Mutex<()>,
    observers: RwLock<Vec<Observer>>,
    next_observer: AtomicU64,
    counters: Arc<Counters>,
}

impl EventDispatcher {
    pub fn new(watch_manager: Arc<WatchManager>, config: &MonitorConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<EventDispatcher>| {
            let weak = weak.clone();
            let callback: DebounceCallback = Arc::new(move |event: FileSystemEvent, ids: Vec<ListenerId>| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.dispatch_debounced(event, ids);
                }
            });

            Self {
                watch_manager,
                debouncer: Arc::new(EventDebouncer::new(config.default_debounce_ms, callback)),
                threads: ThreadManager::new(config.thread_count),
                running: AtomicBool::new(false),
                transition: Mutex::new(()),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                counters: Arc::new(Counters::default()),
            }
        })
    }

    /// Start the worker pool and the debounce scheduler
    pub fn start(&self) -> Result<()> {
        let _guard = self.transition.lock();
        if self.running.load(Ordering::SeqCst) {
            warn!("Event dispatcher already started");
            return Ok(());
        }

        self.threads.start()?;
        if let Err(e) = self.debouncer.start() {
            self.threads.stop();
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        info!("Event dispatcher started");
        Ok(())
    }

    /// Stop the debouncer (dropping pending events), then the worker pool
    pub fn stop(&self) {
        let _guard = self.transition.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Event dispatcher already stopped");
            return;
        }

        self.debouncer.stop();
        self.threads.stop();
        info!("Event dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Route a freshly detected event to the debouncer
    ///
    /// Events nobody listens for are dropped here.
    pub fn dispatch_event(&self, event: FileSystemEvent) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if !self.is_running() {
            trace!("Dispatcher stopped, dropping {}", event);
            return;
        }

        let listener_ids = self.watch_manager.get_matching_listeners(event.path());
        if listener_ids.is_empty() {
            self.counters.dropped_unmatched.fetch_add(1, Ordering::Relaxed);
            trace!("No listener for {}", event);
            return;
        }

        let delays: Vec<u64> = listener_ids
            .iter()
            .filter_map(|id| self.watch_manager.listener(*id))
            .map(|listener| listener.debounce_delay_ms())
            .collect();

        trace!("Queueing {} for {} listener(s)", event, listener_ids.len());
        self.debouncer.add_event(event, &listener_ids, &delays);
    }

    /// Deliver a debounced event, one worker task per listener
    ///
    /// Tasks are keyed by `(listener, path)` so one listener sees events for
    /// a path in the order they left the debouncer.
    pub(crate) fn dispatch_debounced(&self, event: FileSystemEvent, listener_ids: Vec<ListenerId>) {
        self.notify_observers(&event, &listener_ids);

        let event = Arc::new(event);
        for id in listener_ids {
            // Unregistered while the event was pending
            let Some(listener) = self.watch_manager.listener(id) else {
                continue;
            };

            let key = (id, event.path().to_path_buf());
            let event = Arc::clone(&event);
            let counters = Arc::clone(&self.counters);
            let submitted = self.threads.submit_keyed(&key, move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref(), &event)));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{:#}", e)),
                    Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
                };
                if let Some(reason) = failure {
                    counters.listener_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Listener {} failed on {}: {}", id, event, reason);
                }
                Ok(())
            });

            match submitted {
                Ok(()) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!("Dropping delivery to listener {}: {}", id, e),
            }
        }
    }

    /// Register an observer under a free-form tag
    pub fn subscribe(&self, tag: impl Into<String>, callback: ObserverFn) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        let tag = tag.into();
        debug!("Observer '{}' subscribed", tag);
        self.observers.write().push(Observer { id, tag, callback });
        id
    }

    /// Remove an observer; returns `false` if it was not subscribed
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    pub fn observer_tags(&self) -> Vec<String> {
        self.observers.read().iter().map(|o| o.tag.clone()).collect()
    }

    pub fn set_default_debounce_ms(&self, delay_ms: u64) {
        self.debouncer.set_default_delay_ms(delay_ms);
    }

    pub fn default_debounce_ms(&self) -> u64 {
        self.debouncer.default_delay_ms()
    }

    /// Events still waiting in the debouncer
    pub fn pending_count(&self) -> usize {
        self.debouncer.pending_count()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped_unmatched: self.counters.dropped_unmatched.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            listener_failures: self.counters.listener_failures.load(Ordering::Relaxed),
        }
    }

    pub fn watch_manager(&self) -> &Arc<WatchManager> {
        &self.watch_manager
    }

    fn notify_observers(&self, event: &FileSystemEvent, listener_ids: &[ListenerId]) {
        let snapshot: Vec<(String, ObserverFn)> = self
            .observers
            .read()
            .iter()
            .map(|o| (o.tag.clone(), Arc::clone(&o.callback)))
            .collect();

        for (tag, callback) in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event, listener_ids))).is_err() {
                error!("Observer '{}' panicked on {}", tag, event);
            }
        }
    }
}

/// Invoke the typed callback matching the event
fn deliver(listener: &dyn Listener, event: &FileSystemEvent) -> anyhow::Result<()> {
    let path = event.path();
    let empty = Path::new("");
    match event.event_type() {
        EventType::FileCreated => listener.on_file_created(path),
        EventType::FileModified => listener.on_file_modified(path),
        EventType::FileDeleted => listener.on_file_deleted(path),
        EventType::DirectoryCreated => listener.on_directory_created(path),
        EventType::DirectoryDeleted => listener.on_directory_deleted(path),
        EventType::SymlinkCreated => {
            listener.on_symlink_created(path, event.new_target().unwrap_or(empty))
        }
        EventType::SymlinkDeleted => listener.on_symlink_deleted(path),
        EventType::SymlinkTargetChanged => listener.on_symlink_target_changed(
            path,
            event.old_target().unwrap_or(empty),
            event.new_target().unwrap_or(empty),
        ),
    }
}
