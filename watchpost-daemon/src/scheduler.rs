//! Periodic job scheduling with named locks.
//!
//! Cache refresh and other housekeeping jobs run on fixed intervals.
//! Each run is guarded by a named [`JobLock`] so that a slow run is never
//! overlapped by the next tick, and so that a future multi-process
//! deployment can swap in a distributed lock without touching the jobs.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Named lock guarding one periodic job.
///
/// `try_acquire` must be non-blocking: a job that cannot take its lock
/// skips the tick instead of waiting. The TTL bounds how long a crashed
/// holder can block the job.
pub trait JobLock: Send + Sync {
    fn try_acquire(&self, name: &str, ttl: Duration) -> bool;
    fn release(&self, name: &str);
}

/// In-process lock table.
#[derive(Default)]
pub struct LocalJobLock {
    held: DashMap<String, Instant>,
}

impl LocalJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLock for LocalJobLock {
    fn try_acquire(&self, name: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut acquired = false;
        let entry = self
            .held
            .entry(name.to_owned())
            .and_modify(|expires_at| {
                if *expires_at <= now {
                    *expires_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                now + ttl
            });
        drop(entry);
        acquired
    }

    fn release(&self, name: &str) {
        self.held.remove(name);
    }
}

/// Periodic job runner.
///
/// Jobs are plain async closures; the scheduler owns their task handles
/// and joins them all on shutdown.
pub struct Scheduler {
    lock: std::sync::Arc<dyn JobLock>,
    lock_ttl: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        lock: std::sync::Arc<dyn JobLock>,
        lock_ttl: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            lock,
            lock_ttl,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn a named periodic job.
    ///
    /// The first run happens after one full `interval`. A tick whose lock
    /// is still held (previous run in flight) is skipped with a warning.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let lock = std::sync::Arc::clone(&self.lock);
        let ttl = self.lock_ttl;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !lock.try_acquire(name, ttl) {
                            warn!(job = name, "previous run still holds the lock, skipping tick");
                            continue;
                        }
                        job().await;
                        lock.release(name);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(job = name, "scheduler job shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Join all job tasks. Call after broadcasting shutdown.
    pub async fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
