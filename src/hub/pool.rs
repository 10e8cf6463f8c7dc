//! Bounded task execution.
//!
//! Everything the hub runs in the background — lifecycle loops, per-line
//! reader/writer tasks, push fan-outs — goes through a `TaskPool` instead
//! of bare `tokio::spawn`, so total hub concurrency is capped by pool
//! capacity and saturation surfaces as an error at submit time.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Errors from task submission.
#[derive(Debug)]
pub enum PoolError {
    /// All permits are in use; the task was not started.
    Saturated { capacity: usize },
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Saturated { capacity } => {
                write!(f, "Task pool saturated ({} permits in use)", capacity)
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Abstract bounded executor consumed by the hub.
pub trait TaskPool: Send + Sync + 'static {
    fn submit(&self, task: BoxFuture<'static, ()>) -> Result<(), PoolError>;
}

/// Semaphore-bounded pool over the tokio runtime. A permit is held for the
/// lifetime of each submitted task, so long-lived tasks (line readers and
/// writers) count against capacity just like short fan-outs.
pub struct BoundedPool {
    capacity: usize,
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    /// Capacity is floored at 1.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskPool for BoundedPool {
    fn submit(&self, task: BoxFuture<'static, ()>) -> Result<(), PoolError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolError::Saturated {
                capacity: self.capacity,
            })?;
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }
}
