//! Detached background continuations
//!
//! Work that must not hold up the caller's response (post-hoc validation,
//! result logging) is spawned here. Outcomes are only counted and logged.

use crate::errors::BoxError;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackgroundMetrics {
    pub spawned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundQueue {
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach `task`; its result is never returned to the caller
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, E>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let label = label.into();
        let counters = Arc::clone(&self.counters);
        counters.spawned.fetch_add(1, Ordering::Relaxed);

        self.tracker.spawn(async move {
            match task.await {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task = %label, "background task finished");
                }
                Err(error) => {
                    let error: BoxError = error.into();
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task = %label, error = %error, "background task failed");
                }
            }
        });
    }

    pub fn metrics(&self) -> BackgroundMetrics {
        BackgroundMetrics {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.tracker.len() as u64,
        }
    }

    /// Close the tracker and wait for every task spawned so far
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(metrics = ?self.metrics(), "background queue drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_spawned_tasks_are_counted() {
        let queue = BackgroundQueue::new();

        queue.spawn("validate", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, BoxError>(())
        });
        queue.spawn("log-result", async { Err::<(), _>("sink unavailable") });

        assert_eq!(queue.metrics().spawned, 2);

        queue.shutdown().await;
        assert_eq!(
            queue.metrics(),
            BackgroundMetrics {
                spawned: 2,
                succeeded: 1,
                failed: 1,
                in_flight: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_is_not_blocked() {
        let queue = BackgroundQueue::new();
        queue.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BoxError>(())
        });

        tokio::task::yield_now().await;
        assert_eq!(queue.metrics().in_flight, 1);

        queue.shutdown().await;
        assert_eq!(queue.metrics().succeeded, 1);
    }
}
