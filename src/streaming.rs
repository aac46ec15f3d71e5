//! Streaming controller: token chunking, per-stream backpressure, and slow
//! consumer detection.
//!
//! Each stream has a single producer feeding tokens and a single consumer
//! receiving chunks. Tokens accumulate until the chunk budget fills, the
//! chunk timer fires, or a final token arrives; the resulting chunk carries a
//! strictly increasing sequence number. Producers suspend while the unacked
//! window is full and resume as acks release capacity. Streams are mutually
//! independent; only aggregate counters are shared.

use crate::clock::Clock;
use crate::config::StreamingConfig;
use crate::error::InferenceError;
use crate::events::{ControlEvent, ControlEvents};
use crate::protocol::Token;
use crate::tasks::TaskGuard;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const LATENCY_SAMPLES: usize = 256;
const THROUGHPUT_SAMPLES: usize = 128;
const CHUNK_SIZE_SAMPLES: usize = 256;

/// Why a chunk was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timeout,
    Final,
    Manual,
}

/// A batch of tokens handed to the consumer as one unit.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub stream_id: String,
    pub sequence: u64,
    pub tokens: Vec<Token>,
    pub size_bytes: usize,
    pub created_at_ms: u64,
    pub reason: FlushReason,
    pub is_final: bool,
}

/// Receiving side of a stream. Implementations may block; the controller
/// treats a slow `send_chunk` as consumer latency, never as an excuse to
/// reorder.
#[async_trait]
pub trait ChunkConsumer: Send + Sync {
    async fn send_chunk(&self, chunk: Chunk) -> Result<(), InferenceError>;
}

struct PendingChunk {
    sent_at_ms: u64,
    size_bytes: usize,
    ack_timer: JoinHandle<()>,
}

#[derive(Default)]
struct StreamCounters {
    tokens: u64,
    chunks_sent: u64,
    acks: u64,
    cancellations: u64,
}

struct StreamInner {
    buffer: Vec<Token>,
    buffered_bytes: usize,
    sequence: u64,
    pending: HashMap<String, PendingChunk>,
    chunk_timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
    latency_ms: VecDeque<u64>,
    throughput_bps: VecDeque<f64>,
    chunk_sizes: VecDeque<usize>,
    counters: StreamCounters,
}

struct StreamState {
    stream_id: String,
    consumer: Arc<dyn ChunkConsumer>,
    closing: AtomicBool,
    unacked: AtomicUsize,
    ack_notify: Notify,
    inner: tokio::sync::Mutex<StreamInner>,
}

/// Per-stream statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub stream_id: String,
    pub tokens: u64,
    pub chunks_sent: u64,
    pub acks: u64,
    pub cancellations: u64,
    pub unacked: usize,
    pub buffered_bytes: usize,
    pub ack_latency_mean_ms: f64,
    pub ack_latency_p95_ms: u64,
    pub throughput_mean_bps: f64,
    pub avg_chunk_size_bytes: f64,
}

#[derive(Debug, Default)]
struct Totals {
    streams_registered: AtomicU64,
    chunks_sent: AtomicU64,
    tokens: AtomicU64,
    acks: AtomicU64,
    ack_timeouts: AtomicU64,
    backpressure_waits: AtomicU64,
}

/// Aggregate statistics snapshot across all streams.
#[derive(Debug, Clone, Default)]
pub struct StreamingTotals {
    pub streams_registered: u64,
    pub active_streams: usize,
    pub chunks_sent: u64,
    pub tokens: u64,
    pub acks: u64,
    pub ack_timeouts: u64,
    pub backpressure_waits: u64,
}

struct Shared {
    config: StreamingConfig,
    clock: Arc<dyn Clock>,
    events: ControlEvents,
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    totals: Arc<Totals>,
}

/// Aggregates tokens into chunks and paces producers against consumer acks.
///
/// Cloning yields another handle onto the same streams.
#[derive(Clone)]
pub struct StreamingController {
    shared: Arc<Shared>,
}

impl StreamingController {
    pub fn new(config: StreamingConfig, clock: Arc<dyn Clock>, events: ControlEvents) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                events,
                streams: Mutex::new(HashMap::new()),
                totals: Arc::new(Totals::default()),
            }),
        }
    }

    /// Register a stream. Fails if the id is already taken.
    pub fn register_stream(
        &self,
        stream_id: &str,
        consumer: Arc<dyn ChunkConsumer>,
    ) -> Result<(), InferenceError> {
        let mut streams = self.shared.streams.lock().unwrap_or_else(|p| p.into_inner());
        if streams.contains_key(stream_id) {
            return Err(InferenceError::validation("streamId", "stream already registered"));
        }
        streams.insert(
            stream_id.to_string(),
            Arc::new(StreamState {
                stream_id: stream_id.to_string(),
                consumer,
                closing: AtomicBool::new(false),
                unacked: AtomicUsize::new(0),
                ack_notify: Notify::new(),
                inner: tokio::sync::Mutex::new(StreamInner {
                    buffer: Vec::new(),
                    buffered_bytes: 0,
                    sequence: 0,
                    pending: HashMap::new(),
                    chunk_timer: None,
                    timer_epoch: 0,
                    latency_ms: VecDeque::with_capacity(LATENCY_SAMPLES),
                    throughput_bps: VecDeque::with_capacity(THROUGHPUT_SAMPLES),
                    chunk_sizes: VecDeque::with_capacity(CHUNK_SIZE_SAMPLES),
                    counters: StreamCounters::default(),
                }),
            }),
        );
        self.shared.totals.streams_registered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream_id, "stream registered");
        Ok(())
    }

    /// Whether a stream id is currently registered.
    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.shared.streams.lock().unwrap_or_else(|p| p.into_inner()).contains_key(stream_id)
    }

    /// Append a token to a stream, flushing when the chunk budget fills or
    /// the token is final. Suspends while the unacked window is full.
    pub async fn enqueue_token(&self, stream_id: &str, token: Token) -> Result<(), InferenceError> {
        let state = self.shared.get(stream_id)?;
        let is_final = token.is_final;
        let mut token = Some(token);
        let mut waited = false;

        loop {
            if state.closing.load(Ordering::Acquire) {
                return Err(InferenceError::cancelled(
                    "stream closed before backpressure cleared",
                ));
            }
            let mut inner = state.inner.lock().await;

            if let Some(token) = token.take() {
                if inner.buffer.is_empty() && !is_final {
                    self.arm_chunk_timer(&state, &mut inner);
                }
                inner.buffered_bytes += token.size();
                inner.buffer.push(token);
                inner.counters.tokens += 1;
                self.shared.totals.tokens.fetch_add(1, Ordering::Relaxed);
            }

            let reason = if is_final {
                FlushReason::Final
            } else if inner.buffered_bytes >= self.shared.config.chunk_size_bytes {
                FlushReason::Size
            } else {
                return Ok(());
            };

            if state.unacked.load(Ordering::Acquire) >= self.shared.config.max_unacked_chunks {
                // Create the wakeup future before releasing the lock so an
                // ack between unlock and await cannot be missed.
                let notified = state.ack_notify.notified();
                drop(inner);
                if !waited {
                    waited = true;
                    self.shared.totals.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                    self.shared.events.emit(ControlEvent::BackpressureApplied {
                        stream_id: state.stream_id.clone(),
                        unacked: state.unacked.load(Ordering::Acquire),
                    });
                    tracing::debug!(stream_id, "producer suspended on backpressure");
                }
                notified.await;
                continue;
            }

            if waited {
                self.shared
                    .events
                    .emit(ControlEvent::BackpressureReleased { stream_id: state.stream_id.clone() });
                tracing::debug!(stream_id, "producer resumed");
            }
            self.shared.flush_locked(&state, &mut inner, reason).await;
            return Ok(());
        }
    }

    /// Flush buffered tokens immediately, bypassing the size trigger.
    pub async fn flush_stream(&self, stream_id: &str) -> Result<(), InferenceError> {
        let state = self.shared.get(stream_id)?;
        let mut inner = state.inner.lock().await;
        if inner.buffer.is_empty() {
            return Ok(());
        }
        self.shared.flush_locked(&state, &mut inner, FlushReason::Manual).await;
        Ok(())
    }

    /// Acknowledge a delivered chunk, releasing one backpressure waiter.
    pub async fn ack_chunk(&self, stream_id: &str, chunk_id: &str) -> Result<(), InferenceError> {
        let shared = &self.shared;
        let state = shared.get(stream_id)?;
        let mut inner = state.inner.lock().await;
        let Some(pending) = inner.pending.remove(chunk_id) else {
            tracing::warn!(stream_id, chunk_id, "ack for unknown chunk");
            return Ok(());
        };
        pending.ack_timer.abort();
        let now = shared.clock.now_millis();
        let latency = now.saturating_sub(pending.sent_at_ms);

        if inner.latency_ms.len() == LATENCY_SAMPLES {
            inner.latency_ms.pop_front();
        }
        inner.latency_ms.push_back(latency);
        let bps = pending.size_bytes as f64 * 1_000.0 / latency.max(1) as f64;
        if inner.throughput_bps.len() == THROUGHPUT_SAMPLES {
            inner.throughput_bps.pop_front();
        }
        inner.throughput_bps.push_back(bps);
        inner.counters.acks += 1;
        shared.totals.acks.fetch_add(1, Ordering::Relaxed);

        state.unacked.fetch_sub(1, Ordering::AcqRel);
        state.ack_notify.notify_one();

        if latency >= shared.config.slow_consumer_threshold_ms {
            tracing::warn!(stream_id, chunk_id, latency, "slow consumer");
            shared.events.emit(ControlEvent::SlowConsumer {
                stream_id: stream_id.to_string(),
                ack_latency_ms: latency,
            });
        }
        Ok(())
    }

    /// Close a stream: flush the residue as a final chunk, cancel timers,
    /// and reject any producer still blocked on backpressure.
    pub async fn unregister_stream(&self, stream_id: &str) -> Result<(), InferenceError> {
        let state = {
            let mut streams = self.shared.streams.lock().unwrap_or_else(|p| p.into_inner());
            streams
                .remove(stream_id)
                .ok_or_else(|| InferenceError::validation("streamId", "stream not registered"))?
        };
        state.closing.store(true, Ordering::Release);

        let mut inner = state.inner.lock().await;
        if !inner.buffer.is_empty() {
            self.shared.flush_locked(&state, &mut inner, FlushReason::Final).await;
        }
        if let Some(timer) = inner.chunk_timer.take() {
            timer.abort();
        }
        for (_, pending) in inner.pending.drain() {
            pending.ack_timer.abort();
        }
        state.unacked.store(0, Ordering::Release);
        drop(inner);

        state.ack_notify.notify_waiters();
        tracing::debug!(stream_id, "stream unregistered");
        Ok(())
    }

    /// Per-stream statistics, if the stream is registered.
    pub async fn stream_stats(&self, stream_id: &str) -> Option<StreamStats> {
        let state = self.shared.get(stream_id).ok()?;
        let inner = state.inner.lock().await;
        let latency_mean = if inner.latency_ms.is_empty() {
            0.0
        } else {
            inner.latency_ms.iter().sum::<u64>() as f64 / inner.latency_ms.len() as f64
        };
        let mut sorted: Vec<u64> = inner.latency_ms.iter().copied().collect();
        sorted.sort_unstable();
        let p95 = if sorted.is_empty() {
            0
        } else {
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        };
        Some(StreamStats {
            stream_id: state.stream_id.clone(),
            tokens: inner.counters.tokens,
            chunks_sent: inner.counters.chunks_sent,
            acks: inner.counters.acks,
            cancellations: inner.counters.cancellations,
            unacked: state.unacked.load(Ordering::Acquire),
            buffered_bytes: inner.buffered_bytes,
            ack_latency_mean_ms: latency_mean,
            ack_latency_p95_ms: p95,
            throughput_mean_bps: if inner.throughput_bps.is_empty() {
                0.0
            } else {
                inner.throughput_bps.iter().sum::<f64>() / inner.throughput_bps.len() as f64
            },
            avg_chunk_size_bytes: if inner.chunk_sizes.is_empty() {
                0.0
            } else {
                inner.chunk_sizes.iter().sum::<usize>() as f64 / inner.chunk_sizes.len() as f64
            },
        })
    }

    /// Aggregate statistics across streams.
    pub fn totals(&self) -> StreamingTotals {
        let shared = &self.shared;
        StreamingTotals {
            streams_registered: shared.totals.streams_registered.load(Ordering::Relaxed),
            active_streams: shared.streams.lock().unwrap_or_else(|p| p.into_inner()).len(),
            chunks_sent: shared.totals.chunks_sent.load(Ordering::Relaxed),
            tokens: shared.totals.tokens.load(Ordering::Relaxed),
            acks: shared.totals.acks.load(Ordering::Relaxed),
            ack_timeouts: shared.totals.ack_timeouts.load(Ordering::Relaxed),
            backpressure_waits: shared.totals.backpressure_waits.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic aggregate metrics export.
    pub fn spawn_metrics_export(&self) -> TaskGuard {
        let controller = self.clone();
        let interval = Duration::from_millis(self.shared.config.metrics_export_interval_ms.max(1));
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let totals = controller.totals();
                tracing::info!(
                    active_streams = totals.active_streams,
                    chunks_sent = totals.chunks_sent,
                    tokens = totals.tokens,
                    acks = totals.acks,
                    ack_timeouts = totals.ack_timeouts,
                    "streaming totals"
                );
            }
        }))
    }

    /// Lingering partial chunks flush on a timer so trickling streams still
    /// make progress.
    fn arm_chunk_timer(&self, state: &Arc<StreamState>, inner: &mut StreamInner) {
        let shared = Arc::downgrade(&self.shared);
        let stream_id = state.stream_id.clone();
        let epoch = inner.timer_epoch;
        let delay = Duration::from_millis(self.shared.config.chunk_timeout_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else { return };
            shared.timer_flush(&stream_id, epoch).await;
        });
        if let Some(previous) = inner.chunk_timer.replace(handle) {
            previous.abort();
        }
    }
}

impl Shared {
    fn get(&self, stream_id: &str) -> Result<Arc<StreamState>, InferenceError> {
        self.streams
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(stream_id)
            .cloned()
            .ok_or_else(|| InferenceError::validation("streamId", "stream not registered"))
    }

    /// Cut a chunk from the buffer and hand it to the consumer. Runs with
    /// the stream lock held, so only one flush is in flight per stream.
    async fn flush_locked(
        &self,
        state: &Arc<StreamState>,
        inner: &mut StreamInner,
        reason: FlushReason,
    ) {
        let tokens = std::mem::take(&mut inner.buffer);
        let size_bytes = std::mem::take(&mut inner.buffered_bytes);
        if tokens.is_empty() {
            return;
        }
        if let Some(timer) = inner.chunk_timer.take() {
            timer.abort();
        }
        inner.timer_epoch += 1;

        inner.sequence += 1;
        let sequence = inner.sequence;
        let is_final = matches!(reason, FlushReason::Final) || tokens.iter().any(|t| t.is_final);
        let chunk_id = format!("{}-{}", state.stream_id, sequence);
        let now = self.clock.now_millis();
        let chunk = Chunk {
            chunk_id: chunk_id.clone(),
            stream_id: state.stream_id.clone(),
            sequence,
            tokens,
            size_bytes,
            created_at_ms: now,
            reason,
            is_final,
        };

        state.unacked.fetch_add(1, Ordering::AcqRel);
        inner.pending.insert(
            chunk_id.clone(),
            PendingChunk {
                sent_at_ms: now,
                size_bytes,
                ack_timer: self.arm_ack_timer(state, chunk_id.clone()),
            },
        );
        inner.counters.chunks_sent += 1;
        self.totals.chunks_sent.fetch_add(1, Ordering::Relaxed);
        if inner.chunk_sizes.len() == CHUNK_SIZE_SAMPLES {
            inner.chunk_sizes.pop_front();
        }
        inner.chunk_sizes.push_back(size_bytes);

        tracing::trace!(
            stream_id = %state.stream_id,
            sequence,
            size_bytes,
            ?reason,
            "chunk dispatched"
        );
        if let Err(err) = state.consumer.send_chunk(chunk).await {
            tracing::warn!(
                stream_id = %state.stream_id,
                chunk_id,
                code = err.code(),
                "consumer rejected chunk"
            );
            if let Some(pending) = inner.pending.remove(&chunk_id) {
                pending.ack_timer.abort();
                inner.counters.cancellations += 1;
                state.unacked.fetch_sub(1, Ordering::AcqRel);
                state.ack_notify.notify_one();
            }
        }
    }

    /// Unacked chunks time out into cancellations so a dead consumer cannot
    /// pin the window shut forever.
    fn arm_ack_timer(&self, state: &Arc<StreamState>, chunk_id: String) -> JoinHandle<()> {
        let weak: Weak<StreamState> = Arc::downgrade(state);
        let events = self.events.clone();
        let totals = Arc::clone(&self.totals);
        let timeout = Duration::from_millis(self.config.ack_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(state) = weak.upgrade() else { return };
            let mut inner = state.inner.lock().await;
            if inner.pending.remove(&chunk_id).is_some() {
                inner.counters.cancellations += 1;
                totals.ack_timeouts.fetch_add(1, Ordering::Relaxed);
                state.unacked.fetch_sub(1, Ordering::AcqRel);
                state.ack_notify.notify_one();
                tracing::warn!(stream_id = %state.stream_id, chunk_id, "chunk ack timed out");
                events.emit(ControlEvent::ChunkTimeout {
                    stream_id: state.stream_id.clone(),
                    chunk_id,
                });
            }
        })
    }

    async fn timer_flush(&self, stream_id: &str, epoch: u64) {
        let Ok(state) = self.get(stream_id) else { return };
        let mut inner = state.inner.lock().await;
        if inner.timer_epoch != epoch || inner.buffer.is_empty() {
            return;
        }
        if state.unacked.load(Ordering::Acquire) >= self.config.max_unacked_chunks {
            // The producer path will flush once capacity frees up.
            tracing::debug!(stream_id, "timer flush deferred by backpressure");
            return;
        }
        self.flush_locked(&state, &mut inner, FlushReason::Timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// Collects chunks and acks nothing unless asked.
    struct CollectingConsumer {
        chunks: Mutex<Vec<Chunk>>,
        block: Option<Duration>,
    }

    impl CollectingConsumer {
        fn new() -> Arc<Self> {
            Arc::new(Self { chunks: Mutex::new(Vec::new()), block: None })
        }

        fn blocking(delay: Duration) -> Arc<Self> {
            Arc::new(Self { chunks: Mutex::new(Vec::new()), block: Some(delay) })
        }

        fn chunks(&self) -> Vec<Chunk> {
            self.chunks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChunkConsumer for CollectingConsumer {
        async fn send_chunk(&self, chunk: Chunk) -> Result<(), InferenceError> {
            if let Some(delay) = self.block {
                tokio::time::sleep(delay).await;
            }
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    fn controller(config: StreamingConfig) -> StreamingController {
        StreamingController::new(config, Arc::new(ManualClock::new()), ControlEvents::new(64))
    }

    fn small_config() -> StreamingConfig {
        StreamingConfig {
            chunk_size_bytes: 16,
            chunk_timeout_ms: 5_000,
            max_unacked_chunks: 100,
            ack_timeout_ms: 60_000,
            ..StreamingConfig::default()
        }
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let c = controller(small_config());
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();
        assert!(c.register_stream("s1", consumer).is_err());
    }

    #[tokio::test]
    async fn size_trigger_cuts_chunks_in_order() {
        let c = controller(small_config());
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        // 4-byte tokens against a 16-byte budget: every 4th token flushes.
        for i in 0..8 {
            c.enqueue_token("s1", Token::new(i, "abcd")).await.unwrap();
        }
        let chunks = consumer.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[1].sequence, 2);
        assert_eq!(chunks[0].reason, FlushReason::Size);
        assert_eq!(chunks[0].tokens.len(), 4);
        let ids: Vec<u64> = chunks[0].tokens.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3], "tokens stay in arrival order");
    }

    #[tokio::test]
    async fn final_token_flushes_immediately() {
        let c = controller(small_config());
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "a")).await.unwrap();
        c.enqueue_token("s1", Token::final_token(1, "b")).await.unwrap();

        let chunks = consumer.chunks();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].reason, FlushReason::Final);
        assert_eq!(chunks[0].tokens.len(), 2);
    }

    #[tokio::test]
    async fn chunk_timer_flushes_partial_buffer() {
        tokio::time::pause();
        let config = StreamingConfig { chunk_timeout_ms: 100, ..small_config() };
        let c = controller(config);
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "ab")).await.unwrap();
        assert!(consumer.chunks().is_empty(), "below budget, nothing flushed yet");

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        let chunks = consumer.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].reason, FlushReason::Timeout);
    }

    #[tokio::test]
    async fn backpressure_suspends_and_ack_resumes() {
        let config = StreamingConfig {
            chunk_size_bytes: 4,
            max_unacked_chunks: 2,
            ack_timeout_ms: 60_000,
            ..small_config()
        };
        let events = ControlEvents::new(64);
        let c = StreamingController::new(config, Arc::new(ManualClock::new()), events.clone());
        let mut rx = events.subscribe();
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        // Two 4-byte tokens fill the unacked window.
        c.enqueue_token("s1", Token::new(0, "aaaa")).await.unwrap();
        c.enqueue_token("s1", Token::new(1, "bbbb")).await.unwrap();
        assert_eq!(consumer.chunks().len(), 2);

        // The third flush must suspend.
        let producer = {
            let c = c.clone();
            tokio::spawn(async move { c.enqueue_token("s1", Token::new(2, "cccc")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "producer suspended at the window");

        let saw_applied = loop {
            match rx.try_recv() {
                Ok(ControlEvent::BackpressureApplied { stream_id, .. }) => {
                    assert_eq!(stream_id, "s1");
                    break true;
                }
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(saw_applied, "backpressure event fired");

        c.ack_chunk("s1", "s1-1").await.unwrap();
        producer.await.unwrap().unwrap();
        assert_eq!(consumer.chunks().len(), 3, "producer resumed and flushed");

        let saw_released = loop {
            match rx.try_recv() {
                Ok(ControlEvent::BackpressureReleased { .. }) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(saw_released, "release event fired");
    }

    #[tokio::test]
    async fn unregister_rejects_blocked_producer() {
        let config = StreamingConfig {
            chunk_size_bytes: 4,
            max_unacked_chunks: 1,
            ack_timeout_ms: 60_000,
            ..small_config()
        };
        let c = controller(config);
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "aaaa")).await.unwrap();
        let producer = {
            let c = c.clone();
            tokio::spawn(async move { c.enqueue_token("s1", Token::new(1, "bbbb")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        c.unregister_stream("s1").await.unwrap();
        let err = producer.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("backpressure"));
    }

    #[tokio::test]
    async fn unregister_flushes_residue_as_final() {
        let c = controller(small_config());
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "ab")).await.unwrap();
        c.unregister_stream("s1").await.unwrap();

        let chunks = consumer.chunks();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert!(c.register_stream("s1", consumer.clone()).is_ok(), "id is free again");
    }

    #[tokio::test]
    async fn ack_timeout_drops_chunk_and_frees_window() {
        tokio::time::pause();
        let config = StreamingConfig {
            chunk_size_bytes: 4,
            max_unacked_chunks: 1,
            ack_timeout_ms: 500,
            ..small_config()
        };
        let events = ControlEvents::new(64);
        let c = StreamingController::new(config, Arc::new(ManualClock::new()), events.clone());
        let mut rx = events.subscribe();
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "aaaa")).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let saw_timeout = loop {
            match rx.try_recv() {
                Ok(ControlEvent::ChunkTimeout { chunk_id, .. }) => {
                    assert_eq!(chunk_id, "s1-1");
                    break true;
                }
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(saw_timeout);
        let stats = c.stream_stats("s1").await.unwrap();
        assert_eq!(stats.unacked, 0, "window freed");
        assert_eq!(stats.cancellations, 1);
        assert_eq!(c.totals().ack_timeouts, 1);
    }

    #[tokio::test]
    async fn slow_consumer_is_reported() {
        let config = StreamingConfig {
            chunk_size_bytes: 4,
            slow_consumer_threshold_ms: 100,
            ack_timeout_ms: 60_000,
            ..small_config()
        };
        let clock = ManualClock::new();
        let events = ControlEvents::new(64);
        let c = StreamingController::new(config, Arc::new(clock.clone()), events.clone());
        let mut rx = events.subscribe();
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "aaaa")).await.unwrap();
        clock.advance(250);
        c.ack_chunk("s1", "s1-1").await.unwrap();

        let saw_slow = loop {
            match rx.try_recv() {
                Ok(ControlEvent::SlowConsumer { ack_latency_ms, .. }) => {
                    assert_eq!(ack_latency_ms, 250);
                    break true;
                }
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(saw_slow);
        let stats = c.stream_stats("s1").await.unwrap();
        assert!(stats.ack_latency_mean_ms >= 250.0);
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let c = controller(small_config());
        let a = CollectingConsumer::new();
        let b = CollectingConsumer::new();
        c.register_stream("a", a.clone()).unwrap();
        c.register_stream("b", b.clone()).unwrap();

        c.enqueue_token("a", Token::final_token(0, "from-a")).await.unwrap();
        c.enqueue_token("b", Token::final_token(0, "from-b")).await.unwrap();

        assert_eq!(a.chunks().len(), 1);
        assert_eq!(b.chunks().len(), 1);
        assert_eq!(a.chunks()[0].tokens[0].text, "from-a");
        assert_eq!(b.chunks()[0].tokens[0].text, "from-b");
        assert_eq!(a.chunks()[0].sequence, 1, "sequences are per stream");
        assert_eq!(b.chunks()[0].sequence, 1);
    }

    #[tokio::test]
    async fn manual_flush_cuts_a_chunk() {
        let c = controller(small_config());
        let consumer = CollectingConsumer::new();
        c.register_stream("s1", consumer.clone()).unwrap();

        c.enqueue_token("s1", Token::new(0, "ab")).await.unwrap();
        c.flush_stream("s1").await.unwrap();

        let chunks = consumer.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].reason, FlushReason::Manual);
    }

    #[tokio::test]
    async fn blocked_consumer_serializes_flushes() {
        let config = StreamingConfig { chunk_size_bytes: 4, ..small_config() };
        let c = controller(config);
        let consumer = CollectingConsumer::blocking(Duration::from_millis(50));
        c.register_stream("s1", consumer.clone()).unwrap();

        let started = std::time::Instant::now();
        c.enqueue_token("s1", Token::new(0, "aaaa")).await.unwrap();
        c.enqueue_token("s1", Token::new(1, "bbbb")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100), "one flush at a time");
        let chunks = consumer.chunks();
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[1].sequence, 2);
    }
}
