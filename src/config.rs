//! Immutable configuration for the control plane.
//!
//! A [`CoreConfig`] is built once (defaults, struct update syntax, or serde)
//! and threaded explicitly into each component constructor. There is no
//! global configuration and no hot reload.

use crate::error::InferenceError;
use crate::protocol::WorkerStatus;
use serde::Deserialize;

/// Retry executor knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker thresholds, shared by every per-worker breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, timeout_ms: 30_000 }
    }
}

/// Attempt deadlines. `stream=true` always uses the streaming budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub standard_timeout_ms: u64,
    pub streaming_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { standard_timeout_ms: 30_000, streaming_timeout_ms: 120_000 }
    }
}

/// A worker known from configuration before it first registers itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticWorker {
    pub worker_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
}

/// Worker discovery and liveness knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub heartbeat_interval_ms: u64,
    pub offline_timeout_ms: u64,
    pub static_workers: Vec<StaticWorker>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { heartbeat_interval_ms: 5_000, offline_timeout_ms: 15_000, static_workers: Vec::new() }
    }
}

/// Sticky-session routing knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionAffinityConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self { enabled: true, ttl_ms: 300_000, cleanup_interval_ms: 60_000 }
    }
}

/// Load balancer knobs.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BalancerConfig {
    pub session_affinity: SessionAffinityConfig,
    /// When no worker declares the requested model, route to any healthy
    /// worker instead of failing.
    pub fallback_to_all: bool,
}

/// What admission does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    #[default]
    Reject,
    DropLowPriority,
}

/// Scheduler selection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerPolicy {
    pub shortest_job_first: bool,
    pub allow_preemption: bool,
    /// Probability of serving the oldest lower-priority waiter instead of
    /// the top bucket; prevents starvation.
    pub fairness_weight: f64,
    /// Requests whose remaining deadline drops below this are urgent.
    pub urgency_threshold_ms: u64,
    pub aging_enabled: bool,
    pub aging_interval_ms: u64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            shortest_job_first: false,
            allow_preemption: false,
            fairness_weight: 0.1,
            urgency_threshold_ms: 1_000,
            aging_enabled: true,
            aging_interval_ms: 10_000,
        }
    }
}

/// Priority scheduler knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    pub policy: SchedulerPolicy,
    pub drop_policy: DropPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_concurrent: 16,
            policy: SchedulerPolicy::default(),
            drop_policy: DropPolicy::Reject,
        }
    }
}

/// Batch aggregator knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub adaptive_sizing: bool,
    /// Upper bound on acceptable batch processing time.
    pub target_batch_time_ms: u64,
    pub priority_queue: bool,
    pub min_batch_size: usize,
    pub max_batch_size_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            flush_interval_ms: 10,
            adaptive_sizing: false,
            target_batch_time_ms: 50,
            priority_queue: true,
            min_batch_size: 2,
            max_batch_size_limit: 64,
        }
    }
}

/// Streaming controller knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingConfig {
    pub chunk_size_bytes: usize,
    pub chunk_timeout_ms: u64,
    pub max_unacked_chunks: usize,
    pub ack_timeout_ms: u64,
    pub slow_consumer_threshold_ms: u64,
    pub metrics_export_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 64 * 1024,
            chunk_timeout_ms: 100,
            max_unacked_chunks: 100,
            ack_timeout_ms: 5_000,
            slow_consumer_threshold_ms: 1_000,
            metrics_export_interval_ms: 10_000,
        }
    }
}

/// Worker-side request queue knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerQueueConfig {
    pub max_depth: usize,
    pub backpressure_strategy: DropPolicy,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self { max_depth: 64, backpressure_strategy: DropPolicy::Reject }
    }
}

/// Request metadata retention and regression alerting knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataConfig {
    pub retention_ms: u64,
    pub min_samples_for_evaluation: usize,
    /// Emit a rollback request alongside critical alerts.
    pub rollback_on_critical: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { retention_ms: 300_000, min_samples_for_evaluation: 50, rollback_on_critical: false }
    }
}

/// Complete control-plane configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub discovery: DiscoveryConfig,
    pub balancer: BalancerConfig,
    pub scheduler: SchedulerConfig,
    pub batch: BatchConfig,
    pub streaming: StreamingConfig,
    pub worker_queue: WorkerQueueConfig,
    pub metadata: MetadataConfig,
    pub drain_timeout_ms: u64,
    /// Event fan-out buffer; lagging subscribers lose oldest events.
    pub event_buffer: usize,
}

impl CoreConfig {
    /// Range-check every knob. Called by the controller constructor so a
    /// bad config fails fast instead of misbehaving at 3 a.m.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.retry.backoff_multiplier < 1.0 {
            return Err(InferenceError::validation("backoffMultiplier", "must be >= 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(InferenceError::validation("maxDelayMs", "must be >= initialDelayMs"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(InferenceError::validation("failureThreshold", "must be > 0"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(InferenceError::validation("successThreshold", "must be > 0"));
        }
        if self.timeouts.standard_timeout_ms == 0 || self.timeouts.streaming_timeout_ms == 0 {
            return Err(InferenceError::validation("timeouts", "deadlines must be > 0"));
        }
        if self.discovery.offline_timeout_ms < self.discovery.heartbeat_interval_ms {
            return Err(InferenceError::validation(
                "offlineTimeoutMs",
                "must be >= heartbeatIntervalMs",
            ));
        }
        if !(0.0..=1.0).contains(&self.scheduler.policy.fairness_weight) {
            return Err(InferenceError::validation("fairnessWeight", "must be in [0, 1]"));
        }
        if self.scheduler.max_queue_size == 0 || self.scheduler.max_concurrent == 0 {
            return Err(InferenceError::validation("scheduler", "queue and concurrency must be > 0"));
        }
        if self.batch.max_batch_size == 0 {
            return Err(InferenceError::validation("maxBatchSize", "must be > 0"));
        }
        if self.batch.min_batch_size > self.batch.max_batch_size_limit {
            return Err(InferenceError::validation(
                "minBatchSize",
                "must be <= maxBatchSizeLimit",
            ));
        }
        if self.streaming.chunk_size_bytes == 0 || self.streaming.max_unacked_chunks == 0 {
            return Err(InferenceError::validation(
                "streaming",
                "chunk size and unacked window must be > 0",
            ));
        }
        if self.worker_queue.max_depth == 0 {
            return Err(InferenceError::validation("maxDepth", "must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(InferenceError::validation("eventBuffer", "must be > 0"));
        }
        Ok(())
    }

    /// Initial status for statically configured workers.
    pub fn static_worker_status(&self) -> WorkerStatus {
        WorkerStatus::Online
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            discovery: DiscoveryConfig::default(),
            balancer: BalancerConfig::default(),
            scheduler: SchedulerConfig::default(),
            batch: BatchConfig::default(),
            streaming: StreamingConfig::default(),
            worker_queue: WorkerQueueConfig::default(),
            metadata: MetadataConfig::default(),
            drain_timeout_ms: 30_000,
            event_buffer: 256,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
