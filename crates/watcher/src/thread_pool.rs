//! Fixed-size worker pool for listener callbacks

use crate::error::{MonitorError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Unit of work executed on a worker thread
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// How long `stop()` waits for workers before giving up on them
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Message {
    Run(Task),
    Shutdown,
}

struct Pool {
    senders: Vec<Sender<Message>>,
    workers: Vec<JoinHandle<()>>,
    exited: Receiver<()>,
    next: usize,
}

impl Pool {
    fn send(&self, index: usize, task: Task) -> Result<()> {
        self.senders[index % self.senders.len()]
            .send(Message::Run(task))
            .map_err(|_| MonitorError::NotRunning("Thread manager"))
    }
}

/// Worker pool with one FIFO queue per worker
///
/// Tasks submitted with the same key land on the same worker and run in
/// submission order. A failing or panicking task is logged and counted; the
/// worker keeps going.
pub struct ThreadManager {
    thread_count: usize,
    join_timeout: Duration,
    pool: Mutex<Option<Pool>>,
    failures: Arc<AtomicU64>,
}

impl ThreadManager {
    pub fn new(thread_count: usize) -> Self {
        Self::with_join_timeout(thread_count, DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(thread_count: usize, join_timeout: Duration) -> Self {
        Self {
            thread_count: thread_count.max(1),
            join_timeout,
            pool: Mutex::new(None),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the workers
    pub fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            warn!("Thread manager already running");
            return Ok(());
        }

        let (exited_tx, exited) = unbounded::<()>();
        let mut senders = Vec::with_capacity(self.thread_count);
        let mut workers = Vec::with_capacity(self.thread_count);

        for index in 0..self.thread_count {
            let (sender, receiver) = unbounded::<Message>();
            let exited_tx = exited_tx.clone();
            let failures = Arc::clone(&self.failures);
            let spawned = thread::Builder::new()
                .name(format!("fs-monitor-worker-{}", index))
                .spawn(move || {
                    worker_loop(receiver, &failures);
                    let _ = exited_tx.send(());
                });

            match spawned {
                Ok(handle) => {
                    senders.push(sender);
                    workers.push(handle);
                }
                Err(e) => {
                    // Unwind what was started so far
                    for sender in &senders {
                        let _ = sender.send(Message::Shutdown);
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        info!("Started {} worker thread(s)", self.thread_count);
        *pool = Some(Pool {
            senders,
            workers,
            exited,
            next: 0,
        });
        Ok(())
    }

    /// Queue a task on the next worker in turn; fails with `NotRunning` when
    /// the pool is stopped
    pub fn submit_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut pool = self.pool.lock();
        let pool = pool.as_mut().ok_or(MonitorError::NotRunning("Thread manager"))?;
        let index = pool.next;
        pool.next = pool.next.wrapping_add(1);
        pool.send(index, Box::new(task))
    }

    /// Queue a task on the worker owning `key`
    ///
    /// Tasks sharing a key never overlap and run in the order submitted.
    pub fn submit_keyed<K, F>(&self, key: &K, task: F) -> Result<()>
    where
        K: Hash + ?Sized,
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let pool = self.pool.lock();
        let pool = pool.as_ref().ok_or(MonitorError::NotRunning("Thread manager"))?;
        pool.send(hasher.finish() as usize, Box::new(task))
    }

    /// Send a shutdown message to each worker and wait a bounded time for them
    ///
    /// Tasks already queued ahead of the shutdown messages still run.
    pub fn stop(&self) {
        let Some(pool) = self.pool.lock().take() else {
            return;
        };

        for sender in &pool.senders {
            let _ = sender.send(Message::Shutdown);
        }

        let current = thread::current().id();
        let deadline = Instant::now() + self.join_timeout;
        let mut outstanding = pool
            .workers
            .iter()
            .filter(|w| w.thread().id() != current)
            .count();

        while outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if pool.exited.recv_timeout(remaining).is_err() {
                break;
            }
            outstanding -= 1;
        }

        if outstanding > 0 {
            warn!(
                "{} worker thread(s) did not exit within {:?}",
                outstanding, self.join_timeout
            );
            return;
        }

        for handle in pool.workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        debug!("Thread manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Tasks that returned an error or panicked
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: Receiver<Message>, failures: &AtomicU64) {
    while let Ok(message) = receiver.recv() {
        let task = match message {
            Message::Run(task) => task,
            Message::Shutdown => break,
        };

        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!("Task failed: {:#}", e);
            }
            Err(payload) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!("Task panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tasks_run_on_named_workers() {
        let pool = ThreadManager::new(2);
        pool.start().unwrap();

        let (tx, rx) = unbounded();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.submit_task(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
                Ok(())
            })
            .unwrap();
        }

        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
            assert!(name.starts_with("fs-monitor-worker-"));
        }
        pool.stop();
    }

    #[test]
    fn test_failing_tasks_do_not_kill_workers() {
        let pool = ThreadManager::new(1);
        pool.start().unwrap();

        pool.submit_task(|| anyhow::bail!("listener exploded")).unwrap();
        pool.submit_task(|| panic!("listener panicked")).unwrap();

        let (tx, rx) = unbounded();
        pool.submit_task(move || {
            tx.send(()).unwrap();
            Ok(())
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pool.failure_count(), 2);
        pool.stop();
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let pool = ThreadManager::new(1);
        let err = pool.submit_task(|| Ok(())).unwrap_err();
        assert!(matches!(err, MonitorError::NotRunning(_)));

        pool.start().unwrap();
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
        assert!(pool.submit_task(|| Ok(())).is_err());
    }

    #[test]
    fn test_queued_tasks_finish_before_shutdown() {
        let pool = ThreadManager::new(1);
        pool.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.submit_task(move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        pool.stop();
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_keyed_tasks_run_in_submission_order() {
        let pool = ThreadManager::new(4);
        pool.start().unwrap();

        let (tx, rx) = unbounded();
        for i in 0..20u64 {
            let tx = tx.clone();
            // The first task is the slowest; later ones must still wait for it
            let pause = if i == 0 { 100 } else { 0 };
            pool.submit_keyed("same/path", move || {
                thread::sleep(Duration::from_millis(pause));
                tx.send(i).unwrap();
                Ok(())
            })
            .unwrap();
        }

        let order: Vec<u64> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn test_submit_keyed_after_stop_fails() {
        let pool = ThreadManager::new(2);
        assert!(matches!(
            pool.submit_keyed(&7u64, || Ok(())).unwrap_err(),
            MonitorError::NotRunning(_)
        ));
    }

    #[test]
    fn test_stop_is_bounded_by_timeout() {
        let pool = ThreadManager::with_join_timeout(1, Duration::from_millis(50));
        pool.start().unwrap();
        pool.submit_task(|| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap();

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
