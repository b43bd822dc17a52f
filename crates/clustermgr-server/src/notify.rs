//! Notification dispatcher.
//!
//! Module callbacks never run on the caller's task: every notification or
//! completion is queued and executed by a small pool of workers, each job on
//! the blocking pool. Callers may hold the core lock while queueing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MgrError, Result};
use crate::module::MgrModule;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Notifications queued.
    pub queued: u64,
    /// Notifications delivered.
    pub completed: u64,
    /// Notifications whose handler panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Queue plus worker pool delivering `(type, id)` events to modules.
pub struct NotifyDispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    listeners: RwLock<Vec<Arc<dyn MgrModule>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl NotifyDispatcher {
    /// Starts `workers` worker tasks (at least one).
    pub fn start(workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            counters.panicked.fetch_add(1, Ordering::Relaxed);
                            warn!(worker = id, error = %e, "notification job failed");
                        }
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(worker = id, "notify worker exiting");
                })
            })
            .collect();

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            listeners: RwLock::new(Vec::new()),
            workers: Mutex::new(handles),
            counters,
        })
    }

    /// Adds a module to the notification fan-out.
    pub fn register(&self, module: Arc<dyn MgrModule>) {
        debug!(module = module.name(), "registered module");
        self.listeners.write().push(module);
    }

    /// Registered modules.
    pub fn listeners(&self) -> Vec<Arc<dyn MgrModule>> {
        self.listeners.read().clone()
    }

    /// Queues one unit of work.
    pub fn queue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(MgrError::ShuttingDown)?;
        tx.send(Box::new(job)).map_err(|_| MgrError::ShuttingDown)?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues `notify(notify_type, notify_id)` for every module.
    pub fn notify_all(&self, notify_type: &str, notify_id: &str) {
        debug!(notify_type, notify_id, "notify_all");
        for module in self.listeners() {
            let notify_type = notify_type.to_string();
            let notify_id = notify_id.to_string();
            let name = module.name().to_string();
            let queued = self.queue(move || module.notify(&notify_type, &notify_id));
            if let Err(e) = queued {
                warn!(module = %name, error = %e, "notification not queued");
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work and waits for queued jobs to finish.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for NotifyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyDispatcher")
            .field("listeners", &self.listeners.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::RecordingModule;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_all_reaches_every_module() {
        let dispatcher = NotifyDispatcher::start(2);
        let a = Arc::new(RecordingModule::new("a"));
        let b = Arc::new(RecordingModule::new("b"));
        dispatcher.register(a.clone());
        dispatcher.register(b.clone());

        dispatcher.notify_all("osd_map", "");
        dispatcher.notify_all("command", "tag-1");
        dispatcher.shutdown().await;

        for m in [&a, &b] {
            let mut events = m.events();
            events.sort();
            assert_eq!(
                events,
                vec![
                    ("command".to_string(), "tag-1".to_string()),
                    ("osd_map".to_string(), String::new()),
                ]
            );
        }
        assert_eq!(dispatcher.stats().completed, 4);
    }

    #[tokio::test]
    async fn test_queue_does_not_run_inline() {
        let dispatcher = NotifyDispatcher::start(1);
        let lock = Arc::new(Mutex::new(0u32));
        {
            let _held = lock.lock();
            let lock2 = lock.clone();
            // would deadlock if the job ran on this task
            dispatcher.queue(move || *lock2.lock() += 1).unwrap();
        }
        dispatcher.shutdown().await;
        assert_eq!(*lock.lock(), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_workers() {
        let dispatcher = NotifyDispatcher::start(1);
        dispatcher.queue(|| panic!("boom")).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        dispatcher.queue(move || tx.send(()).unwrap()).unwrap();
        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.stats().panicked, 1);
    }

    #[tokio::test]
    async fn test_queue_after_shutdown() {
        let dispatcher = NotifyDispatcher::start(1);
        dispatcher.shutdown().await;
        assert!(matches!(dispatcher.queue(|| {}), Err(MgrError::ShuttingDown)));
    }
}
