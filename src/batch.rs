//! Batch aggregation for small same-kind RPCs.
//!
//! Tokenize and draft-check calls are cheap individually but chatty; the
//! batch queue coalesces them per kind and dispatches one batched invocation
//! when the buffer fills or a short timer expires. Entries fail or succeed
//! individually; only a dispatch-level failure fails a whole batch.

use crate::clock::Clock;
use crate::config::BatchConfig;
use crate::error::InferenceError;
use crate::protocol::{BatchKind, Priority};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const BATCH_TIME_WINDOW: usize = 64;
const QUEUE_LATENCY_WINDOW: usize = 256;
/// Consecutive full batches required before adaptive sizing grows the batch.
const GROWTH_STREAK: u32 = 3;

/// Executes one batched invocation. Returns one result per entry, in order.
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        kind: BatchKind,
        payloads: Vec<Value>,
    ) -> Result<Vec<Result<Value, InferenceError>>, InferenceError>;
}

struct PendingEntry {
    payload: Value,
    priority: Priority,
    enqueued_at_ms: u64,
    reply: oneshot::Sender<Result<Value, InferenceError>>,
}

#[derive(Default)]
struct KindCounters {
    batches: u64,
    requests: u64,
    batch_size_sum: u64,
}

struct KindState {
    pending: Vec<PendingEntry>,
    /// Bumped whenever the buffer is taken; stale deferred flushes no-op.
    epoch: u64,
    current_max: usize,
    full_streak: u32,
    batch_times: VecDeque<u64>,
    queue_latencies: VecDeque<u64>,
    counters: KindCounters,
}

/// Per-kind statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BatchKindStats {
    pub batches: u64,
    pub requests: u64,
    /// Requests per dispatched batch.
    pub efficiency: f64,
    pub avg_batch_size: f64,
    pub batch_time_p50_ms: u64,
    pub batch_time_p95_ms: u64,
    pub batch_time_p99_ms: u64,
    pub queue_latency_p95_ms: u64,
    pub current_max_batch_size: usize,
    pub pending: usize,
}

struct Shared {
    config: BatchConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn BatchDispatcher>,
    kinds: HashMap<BatchKind, Mutex<KindState>>,
}

/// Coalesces same-kind calls into batched dispatches.
pub struct BatchQueue {
    shared: Arc<Shared>,
}

impl BatchQueue {
    pub fn new(
        config: BatchConfig,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn BatchDispatcher>,
    ) -> Self {
        let kinds = BatchKind::ALL
            .iter()
            .map(|&kind| {
                (
                    kind,
                    Mutex::new(KindState {
                        pending: Vec::new(),
                        epoch: 0,
                        current_max: config.max_batch_size,
                        full_streak: 0,
                        batch_times: VecDeque::with_capacity(BATCH_TIME_WINDOW),
                        queue_latencies: VecDeque::with_capacity(QUEUE_LATENCY_WINDOW),
                        counters: KindCounters::default(),
                    }),
                )
            })
            .collect();
        Self { shared: Arc::new(Shared { config, clock, dispatcher, kinds }) }
    }

    /// Submit one call and wait for its individual result.
    pub async fn submit(
        &self,
        kind: BatchKind,
        payload: Value,
        priority: Priority,
    ) -> Result<Value, InferenceError> {
        let (reply, response) = oneshot::channel();
        {
            let shared = &self.shared;
            let mut state = shared.kind(kind);
            state.pending.push(PendingEntry {
                payload,
                priority,
                enqueued_at_ms: shared.clock.now_millis(),
                reply,
            });
            if state.pending.len() >= state.current_max {
                let batch = Shared::take(&mut state);
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.run_batch(kind, batch).await });
            } else if state.pending.len() == 1 {
                // First entry arms the deferred flush.
                let epoch = state.epoch;
                let shared = Arc::clone(&self.shared);
                let delay = Duration::from_millis(self.shared.config.flush_interval_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.deferred_flush(kind, epoch).await;
                });
            }
        }
        response.await.map_err(|_| InferenceError::internal("batch dispatcher dropped reply"))?
    }

    /// Flush whatever is pending for a kind without waiting for a trigger.
    pub async fn flush_now(&self, kind: BatchKind) {
        let batch = {
            let mut state = self.shared.kind(kind);
            if state.pending.is_empty() {
                return;
            }
            Shared::take(&mut state)
        };
        self.shared.run_batch(kind, batch).await;
    }

    pub fn stats(&self, kind: BatchKind) -> BatchKindStats {
        let state = self.shared.kind(kind);
        let percentile = |samples: &VecDeque<u64>, p: f64| -> u64 {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted: Vec<u64> = samples.iter().copied().collect();
            sorted.sort_unstable();
            let rank = ((sorted.len() as f64) * p).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        };
        let batches = state.counters.batches;
        BatchKindStats {
            batches,
            requests: state.counters.requests,
            efficiency: if batches == 0 {
                0.0
            } else {
                state.counters.requests as f64 / batches as f64
            },
            avg_batch_size: if batches == 0 {
                0.0
            } else {
                state.counters.batch_size_sum as f64 / batches as f64
            },
            batch_time_p50_ms: percentile(&state.batch_times, 0.50),
            batch_time_p95_ms: percentile(&state.batch_times, 0.95),
            batch_time_p99_ms: percentile(&state.batch_times, 0.99),
            queue_latency_p95_ms: percentile(&state.queue_latencies, 0.95),
            current_max_batch_size: state.current_max,
            pending: state.pending.len(),
        }
    }
}

impl Shared {
    fn kind(&self, kind: BatchKind) -> std::sync::MutexGuard<'_, KindState> {
        self.kinds
            .get(&kind)
            .expect("every batch kind is registered at construction")
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Take the buffer for dispatch; new enqueues accumulate fresh.
    fn take(state: &mut KindState) -> Vec<PendingEntry> {
        state.epoch += 1;
        std::mem::take(&mut state.pending)
    }

    async fn deferred_flush(self: Arc<Self>, kind: BatchKind, epoch: u64) {
        let batch = {
            let mut state = self.kind(kind);
            // A size-triggered flush already took this buffer.
            if state.epoch != epoch || state.pending.is_empty() {
                return;
            }
            Shared::take(&mut state)
        };
        self.run_batch(kind, batch).await;
    }

    async fn run_batch(&self, kind: BatchKind, mut batch: Vec<PendingEntry>) {
        if batch.is_empty() {
            return;
        }
        if self.config.priority_queue {
            batch.sort_by_key(|e| (e.priority.index(), e.enqueued_at_ms));
        }
        let size = batch.len();
        let now = self.clock.now_millis();
        let latencies: Vec<u64> = batch.iter().map(|e| now.saturating_sub(e.enqueued_at_ms)).collect();
        let payloads: Vec<Value> = batch.iter().map(|e| e.payload.clone()).collect();

        tracing::debug!(kind = kind.as_str(), size, "dispatching batch");
        let started = self.clock.now_millis();
        let outcome = self.dispatcher.dispatch(kind, payloads).await;
        let elapsed = self.clock.now_millis().saturating_sub(started);

        match outcome {
            Ok(results) if results.len() == size => {
                for (entry, result) in batch.into_iter().zip(results) {
                    let _ = entry.reply.send(result);
                }
            }
            Ok(results) => {
                tracing::error!(
                    kind = kind.as_str(),
                    expected = size,
                    got = results.len(),
                    "batch result count mismatch"
                );
                for entry in batch {
                    let _ = entry.reply.send(Err(InferenceError::internal(
                        "batch result count mismatch",
                    )));
                }
            }
            Err(err) => {
                tracing::warn!(kind = kind.as_str(), code = err.code(), "batch dispatch failed");
                for entry in batch {
                    let _ = entry.reply.send(Err(err.clone()));
                }
            }
        }

        let mut state = self.kind(kind);
        state.counters.batches += 1;
        state.counters.requests += size as u64;
        state.counters.batch_size_sum += size as u64;
        if state.batch_times.len() == BATCH_TIME_WINDOW {
            state.batch_times.pop_front();
        }
        state.batch_times.push_back(elapsed);
        for latency in latencies {
            if state.queue_latencies.len() == QUEUE_LATENCY_WINDOW {
                state.queue_latencies.pop_front();
            }
            state.queue_latencies.push_back(latency);
        }
        if size >= state.current_max {
            state.full_streak += 1;
        } else {
            state.full_streak = 0;
        }
        if self.config.adaptive_sizing {
            self.adapt(&mut state);
        }
    }

    /// Shrink when batches run past the time target; grow only when they run
    /// well under it and the queue keeps filling.
    fn adapt(&self, state: &mut KindState) {
        if state.batch_times.is_empty() {
            return;
        }
        let avg =
            state.batch_times.iter().sum::<u64>() as f64 / state.batch_times.len() as f64;
        let target = self.config.target_batch_time_ms as f64;
        if avg > target && state.current_max > self.config.min_batch_size {
            state.current_max -= 1;
            tracing::debug!(current_max = state.current_max, avg, "batch size shrunk");
        } else if avg < target / 2.0
            && state.full_streak >= GROWTH_STREAK
            && state.current_max < self.config.max_batch_size_limit
        {
            state.current_max += 1;
            state.full_streak = 0;
            tracing::debug!(current_max = state.current_max, avg, "batch size grown");
        }
    }
}
