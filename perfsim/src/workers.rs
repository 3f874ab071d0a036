//! Bounded pool for fire-and-forget background work.
//!
//! Stands in for spawning sibling request handlers: the initiator hands a
//! task to the pool and moves on. It never awaits completion and never sees a
//! spawned task's failure; failures are only logged.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::PerfSimResult;

/// Pool admitting at most `capacity` concurrently running tasks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool with room for `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum number of concurrently running tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Spawn `task` onto the current Tokio runtime if the pool has room.
    ///
    /// Returns `false` when the pool is full; the task is dropped unrun. An
    /// admitted task holds its slot until it finishes.
    pub fn spawn_detached<F>(&self, name: &str, task: F) -> bool
    where
        F: Future<Output = PerfSimResult<()>> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    worker = %name,
                    capacity = self.capacity,
                    "worker pool full, task dropped"
                );
                return false;
            }
        };

        let name = name.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            match task.await {
                Ok(()) => tracing::debug!(worker = %name, "worker finished"),
                Err(e) => tracing::warn!(worker = %name, error = %e, "worker failed"),
            }
        });
        true
    }
}
