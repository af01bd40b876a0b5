//! Bounded runner for detached work.
//!
//! Notifications and large invalidations run off the request path. Each
//! task's outcome is logged and counted, so a failure is observable in
//! [`TaskStats`] and metrics rather than vanishing. [`BackgroundTasks::drain`]
//! waits for quiescence (shutdown, tests).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.spawned.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct Counts {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    counts: Arc<Counts>,
}

impl BackgroundTasks {
    /// At most `limit` tasks execute at once; the rest wait for a permit.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            counts: Arc::new(Counts::default()),
        }
    }

    /// Run `work` detached. Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, name: &'static str, work: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let counts = self.counts.clone();
        counts.spawned.fetch_add(1, Ordering::Relaxed);

        let mut tasks = self.tasks.lock();
        // Reap whatever already finished so the set does not grow unbounded.
        while let Some(joined) = tasks.try_join_next() {
            if joined.is_err() {
                counts.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            match work.await {
                Ok(()) => {
                    counts.completed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_background_task(name, "completed");
                    debug!(task = name, "Background task completed");
                }
                Err(e) => {
                    counts.failed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_background_task(name, "failed");
                    warn!(task = name, error = %e, "Background task failed");
                }
            }
        });
        crate::metrics::set_background_tasks(tasks.len());
    }

    /// Wait until every spawned task (including ones spawned meanwhile) has finished.
    pub async fn drain(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    // Panicked or aborted before it could count itself
                    self.counts.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Background task did not finish");
                }
            }
        }
        crate::metrics::set_background_tasks(0);
    }

    #[must_use]
    pub fn stats(&self) -> TaskStats {
        TaskStats {
            spawned: self.counts.spawned.load(Ordering::Relaxed),
            completed: self.counts.completed.load(Ordering::Relaxed),
            failed: self.counts.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(64)
    }
}
