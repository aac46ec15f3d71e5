//! Ownership of background tasks.
//!
//! Components that spawn periodic work (heartbeat sweep, affinity eviction,
//! aging, metrics export, retention) hold a [`TaskGuard`]; dropping the guard
//! aborts the task so nothing outlives its owner.

use tokio::task::JoinHandle;

/// Aborts the wrapped task on drop.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Abort explicitly; equivalent to dropping the guard.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
