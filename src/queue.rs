//! Bounded concurrency queue for outbound enrichment fetches.
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs at most `limit` submitted tasks at once. Waiters are admitted in FIFO
/// order (tokio's semaphore is fair). Each task's outcome is independent.
#[derive(Debug, Clone)]
pub struct BoundedQueue {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BoundedQueue {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a slot, then run `task` to completion.
    pub async fn submit<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so acquire only fails if it were.
        let _permit = self.permits.acquire().await.ok();
        task.await
    }
}

impl Default for BoundedQueue {
    fn default() -> Self {
        Self::new(2)
    }
}
