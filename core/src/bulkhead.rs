//! Bulkhead semaphore bounding how many operations run at once
//!
//! A thin wrapper over [`tokio::sync::Semaphore`]. Guards own their permit,
//! so they can move into spawned tasks and still release on drop.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A semaphore-based bulkhead for limiting concurrent operations
#[derive(Debug, Clone)]
pub struct BulkheadSemaphore {
    /// Maximum number of concurrent permits
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl BulkheadSemaphore {
    /// Create a new bulkhead semaphore with the given concurrency limit
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "Bulkhead limit must be greater than 0");
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Try to acquire a permit without blocking
    ///
    /// Returns `None` if the bulkhead is at capacity or closed.
    pub fn try_acquire(&self) -> Option<BulkheadGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(BulkheadGuard { _permit: permit })
    }

    /// Wait until a permit is free and take it
    ///
    /// Returns `None` only once the bulkhead has been closed.
    pub async fn acquire(&self) -> Option<BulkheadGuard> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(BulkheadGuard { _permit: permit })
    }

    /// Stop handing out permits and wake every waiter with `None`
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics or its future is dropped.
#[derive(Debug)]
pub struct BulkheadGuard {
    _permit: OwnedSemaphorePermit,
}
