//! Bounded priority FIFO inside each worker.
//!
//! Three levels, FIFO per level. When full, either reject the newcomer or
//! drop the oldest low-priority entry, depending on the configured strategy.

use crate::clock::Clock;
use crate::config::{DropPolicy, WorkerQueueConfig};
use crate::error::InferenceError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Worker-local priority levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPriority {
    High,
    Medium,
    Low,
}

impl WorkerPriority {
    const LEVELS: usize = 3;

    fn index(&self) -> usize {
        match self {
            WorkerPriority::High => 0,
            WorkerPriority::Medium => 1,
            WorkerPriority::Low => 2,
        }
    }
}

struct QueuedItem<T> {
    item: T,
    enqueued_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerQueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub depth: usize,
    pub avg_wait_ms: f64,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    rejected: u64,
    dropped: u64,
    wait_total_ms: u64,
}

struct Inner<T> {
    levels: [VecDeque<QueuedItem<T>>; WorkerPriority::LEVELS],
    counters: Counters,
}

/// Bounded FIFO-by-priority queue.
///
/// Cloning yields another handle onto the same queue.
pub struct WorkerQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    config: WorkerQueueConfig,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for WorkerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T> WorkerQueue<T> {
    pub fn new(config: WorkerQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                levels: Default::default(),
                counters: Counters::default(),
            })),
            config,
            clock,
        }
    }

    /// Enqueue an item. At capacity, the behavior follows the configured
    /// strategy: reject the newcomer, or drop the oldest LOW (then MEDIUM)
    /// entry to make room. HIGH entries are never dropped.
    pub fn push(&self, item: T, priority: WorkerPriority) -> Result<(), InferenceError> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let depth: usize = inner.levels.iter().map(VecDeque::len).sum();
        if depth >= self.config.max_depth {
            match self.config.backpressure_strategy {
                DropPolicy::Reject => {
                    inner.counters.rejected += 1;
                    return Err(InferenceError::QueueFull { depth, max: self.config.max_depth });
                }
                DropPolicy::DropLowPriority => {
                    let victim_level = [WorkerPriority::Low, WorkerPriority::Medium]
                        .into_iter()
                        .map(|p| p.index())
                        .find(|&l| !inner.levels[l].is_empty());
                    match victim_level {
                        Some(level) => {
                            inner.levels[level].pop_front();
                            inner.counters.dropped += 1;
                        }
                        None => {
                            inner.counters.rejected += 1;
                            return Err(InferenceError::QueueFull {
                                depth,
                                max: self.config.max_depth,
                            });
                        }
                    }
                }
            }
        }
        inner.levels[priority.index()].push_back(QueuedItem { item, enqueued_at_ms: now });
        inner.counters.enqueued += 1;
        Ok(())
    }

    /// Dequeue the oldest item from the highest non-empty level.
    pub fn pop(&self) -> Option<T> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for level in 0..WorkerPriority::LEVELS {
            if let Some(queued) = inner.levels[level].pop_front() {
                inner.counters.dequeued += 1;
                inner.counters.wait_total_ms += now.saturating_sub(queued.enqueued_at_ms);
                return Some(queued.item);
            }
        }
        None
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).levels.iter().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> WorkerQueueStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let depth = inner.levels.iter().map(VecDeque::len).sum();
        WorkerQueueStats {
            enqueued: inner.counters.enqueued,
            dequeued: inner.counters.dequeued,
            rejected: inner.counters.rejected,
            dropped: inner.counters.dropped,
            depth,
            avg_wait_ms: if inner.counters.dequeued == 0 {
                0.0
            } else {
                inner.counters.wait_total_ms as f64 / inner.counters.dequeued as f64
            },
        }
    }
}
