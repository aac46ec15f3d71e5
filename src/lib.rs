#![forbid(unsafe_code)]

//! # modelherd
//!
//! Control-plane orchestration for distributed ML inference serving. The
//! crate sits between client requests and a pool of model worker processes:
//! it tracks worker health, routes each request to a capable worker, paces
//! admission under load, coalesces chatty RPCs, and streams generated tokens
//! back with flow control.
//!
//! ## Pieces
//!
//! - **Registry + health**: workers register and heartbeat over the bus;
//!   stale ones flip offline and leave the routing pool.
//! - **Routing**: a composite of retry (always on a different worker),
//!   per-worker circuit breakers, attempt deadlines, and a load balancer
//!   with session affinity.
//! - **Scheduling**: five priority buckets with deadline urgency, aging,
//!   starvation fairness, shortest-job-first, and tenant fair queuing.
//! - **Streaming**: token chunking with per-stream backpressure, ack
//!   timeouts, and slow-consumer detection.
//! - **Batching**: size- and time-triggered coalescing of small RPCs.
//! - **Worker-side**: bounded priority queue, rolling metrics, hardware
//!   tier classification, and a pinning-aware model cache.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelherd::{Controller, CoreConfig, InMemoryBus, InferenceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), modelherd::InferenceError> {
//!     let bus = Arc::new(InMemoryBus::new());
//!     let controller = Controller::new(CoreConfig::new(), bus)?;
//!     controller.start().await?;
//!
//!     let request = InferenceRequest::new("req-1", "llama-7b", "why is the sky blue?");
//!     let stream = controller.handle_inference_request(request).await?;
//!     let tokens = stream.collect().await?;
//!     println!("{}", tokens.join(""));
//!
//!     controller.stop().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod balancer;
mod batch;
mod breaker;
mod bus;
mod clock;
mod config;
mod controller;
mod error;
mod events;
mod jitter;
mod metadata;
mod protocol;
mod registry;
mod retry;
mod scheduler;
mod sleeper;
mod streaming;
mod tasks;
mod timeout;
pub mod worker;

// Re-exports
pub use backoff::Backoff;
pub use balancer::SmartBalancer;
pub use batch::{BatchDispatcher, BatchKindStats, BatchQueue};
pub use breaker::{BreakerSet, BreakerState, BreakerStats, CircuitBreaker};
pub use bus::{BusSubscription, InMemoryBus, MessageBus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BalancerConfig, BatchConfig, BreakerConfig, CoreConfig, DiscoveryConfig, DropPolicy,
    MetadataConfig, RetryConfig, SchedulerConfig, SchedulerPolicy, SessionAffinityConfig,
    StaticWorker, StreamingConfig, TimeoutConfig, WorkerQueueConfig,
};
pub use controller::{Controller, LifecycleState, StreamEvent, TokenStream};
pub use error::InferenceError;
pub use events::{AlertSeverity, ControlEvent, ControlEvents, RegressionMetric};
pub use jitter::Jitter;
pub use metadata::{
    Baseline, MetadataStore, RegressionDetector, RegressionSample, RequestMetadata,
};
pub use protocol::{
    BatchKind, ChatMessage, InferenceRequest, ModelTier, Priority, PromptPayload, ResponseEvent,
    Token, WorkerCapabilities, WorkerDeregistration, WorkerHeartbeat, WorkerMetrics,
    WorkerRegistration, WorkerSkills, WorkerStatus,
};
pub use registry::{Worker, WorkerRegistry};
pub use retry::{AttemptFailure, RetryExecutor};
pub use scheduler::{PriorityScheduler, SchedulerPermit, SchedulerStats};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use streaming::{
    Chunk, ChunkConsumer, FlushReason, StreamStats, StreamingController, StreamingTotals,
};
pub use tasks::TaskGuard;
pub use timeout::DeadlineEnforcer;

pub mod prelude;
