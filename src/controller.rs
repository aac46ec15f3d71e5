//! Controller orchestrator.
//!
//! Owns the public inference entry point and wires the registry, breakers,
//! balancer, scheduler, streaming controller, and metadata store together.
//! Components only meet here: each is handed narrow inputs per call rather
//! than holding back-pointers to the others.

use crate::balancer::SmartBalancer;
use crate::batch::{BatchDispatcher, BatchQueue};
use crate::breaker::BreakerSet;
use crate::bus::{BusSubscription, MessageBus};
use crate::clock::{Clock, MonotonicClock};
use crate::config::CoreConfig;
use crate::error::InferenceError;
use crate::events::ControlEvents;
use crate::metadata::{MetadataStore, RegressionDetector, RegressionSample};
use crate::protocol::{
    self, BatchKind, InferenceRequest, ResponseEvent, WorkerDeregistration, WorkerHeartbeat,
    WorkerRegistration,
};
use crate::registry::{Worker, WorkerRegistry};
use crate::retry::{AttemptFailure, RetryExecutor};
use crate::scheduler::{PriorityScheduler, SchedulerPermit, SchedulerStats};
use crate::streaming::StreamingController;
use crate::tasks::TaskGuard;
use crate::timeout::DeadlineEnforcer;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const TOKEN_CHANNEL_BUFFER: usize = 256;

/// Controller life-cycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Registering,
    Starting,
    Ready,
    Draining,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Idle,
            1 => LifecycleState::Connecting,
            2 => LifecycleState::Registering,
            3 => LifecycleState::Starting,
            4 => LifecycleState::Ready,
            5 => LifecycleState::Draining,
            6 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    fn raw(self) -> u8 {
        match self {
            LifecycleState::Idle => 0,
            LifecycleState::Connecting => 1,
            LifecycleState::Registering => 2,
            LifecycleState::Starting => 3,
            LifecycleState::Ready => 4,
            LifecycleState::Draining => 5,
            LifecycleState::Stopping => 6,
            LifecycleState::Stopped => 7,
        }
    }
}

/// Events surfaced on the client-facing token stream.
#[derive(Debug)]
pub enum StreamEvent {
    Token(String),
    Done { total_tokens: u64, latency_ms: u64 },
    Error(InferenceError),
}

/// Client handle to one request's output.
#[derive(Debug)]
pub struct TokenStream {
    request_id: String,
    receiver: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next event, or `None` once the stream is finished and drained.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Drain the stream, returning every token on success.
    pub async fn collect(mut self) -> Result<Vec<String>, InferenceError> {
        let mut tokens = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(text) => tokens.push(text),
                StreamEvent::Done { .. } => return Ok(tokens),
                StreamEvent::Error(err) => return Err(err),
            }
        }
        Err(InferenceError::cancelled("stream closed without completion"))
    }
}

impl futures::Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<StreamEvent>> {
        self.receiver.poll_recv(cx)
    }
}

struct ActiveRequest {
    worker_id: Option<String>,
    cancel: watch::Sender<bool>,
}

struct AttemptSuccess {
    worker: Worker,
    subscription: BusSubscription,
    first_event: ResponseEvent,
}

struct Inner {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    events: ControlEvents,
    bus: Arc<dyn MessageBus>,
    registry: WorkerRegistry,
    breakers: BreakerSet,
    balancer: SmartBalancer,
    scheduler: PriorityScheduler,
    streaming: StreamingController,
    metadata: MetadataStore,
    detector: RegressionDetector,
    retry: RetryExecutor,
    deadlines: DeadlineEnforcer,
    state: AtomicU8,
    active: Mutex<HashMap<String, ActiveRequest>>,
    tasks: Mutex<Vec<TaskGuard>>,
}

/// The control-plane orchestration engine.
///
/// Cloning yields another handle onto the same controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Build a controller over a transport. Fails fast on invalid config.
    pub fn new(config: CoreConfig, bus: Arc<dyn MessageBus>) -> Result<Self, InferenceError> {
        Self::with_clock(config, bus, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        config: CoreConfig,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InferenceError> {
        config.validate()?;
        let events = ControlEvents::new(config.event_buffer);
        let registry =
            WorkerRegistry::new(config.discovery.clone(), Arc::clone(&clock), events.clone());
        let breakers =
            BreakerSet::new(config.breaker.clone(), Arc::clone(&clock), events.clone());
        let balancer = SmartBalancer::new(config.balancer.clone(), Arc::clone(&clock));
        let scheduler =
            PriorityScheduler::new(config.scheduler.clone(), Arc::clone(&clock), events.clone());
        let streaming =
            StreamingController::new(config.streaming.clone(), Arc::clone(&clock), events.clone());
        let metadata = MetadataStore::new(&config.metadata, Arc::clone(&clock));
        let detector = RegressionDetector::new(&config.metadata, events.clone());
        let retry = RetryExecutor::new(&config.retry);
        let deadlines = DeadlineEnforcer::new(&config.timeouts);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                events,
                bus,
                registry,
                breakers,
                balancer,
                scheduler,
                streaming,
                metadata,
                detector,
                retry,
                deadlines,
                state: AtomicU8::new(LifecycleState::Idle.raw()),
                active: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.inner.state.store(state.raw(), Ordering::Release);
        tracing::info!(?state, "controller state");
    }

    /// Bring the controller up: connect control-plane subscriptions, seed
    /// registrations, start background tasks. Rejects unless idle.
    pub async fn start(&self) -> Result<(), InferenceError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                LifecycleState::Idle.raw(),
                LifecycleState::Connecting.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(InferenceError::internal(format!(
                "start requires the idle state (currently {:?})",
                self.state()
            )));
        }

        let register = inner.bus.subscribe(protocol::TOPIC_REGISTER).await;
        let heartbeat = inner.bus.subscribe(protocol::TOPIC_HEARTBEAT).await;
        let deregister = inner.bus.subscribe(protocol::TOPIC_DEREGISTER).await;
        let (register, heartbeat, deregister) = match (register, heartbeat, deregister) {
            (Ok(r), Ok(h), Ok(d)) => (r, h, d),
            _ => {
                self.set_state(LifecycleState::Idle);
                return Err(InferenceError::internal("control topic subscription failed"));
            }
        };

        self.set_state(LifecycleState::Registering);
        // Static workers were seeded by the registry constructor; nothing
        // further to announce here.

        self.set_state(LifecycleState::Starting);
        let mut tasks = inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(self.spawn_control_pump("register", register));
        tasks.push(self.spawn_control_pump("heartbeat", heartbeat));
        tasks.push(self.spawn_control_pump("deregister", deregister));
        tasks.push(inner.registry.spawn_sweeper());
        tasks.push(inner.balancer.spawn_affinity_cleanup());
        tasks.push(inner.scheduler.spawn_aging());
        tasks.push(inner.streaming.spawn_metrics_export());
        tasks.push(inner.metadata.spawn_retention());
        drop(tasks);

        self.set_state(LifecycleState::Ready);
        Ok(())
    }

    /// Drain and stop. Waits up to the configured drain timeout for active
    /// requests, then tears everything down.
    pub async fn stop(&self) {
        match self.state() {
            LifecycleState::Stopped | LifecycleState::Stopping | LifecycleState::Draining => return,
            _ => {}
        }
        self.set_state(LifecycleState::Draining);

        let drain = Duration::from_millis(self.inner.config.drain_timeout_ms);
        let inner = Arc::clone(&self.inner);
        let drained = tokio::time::timeout(drain, async move {
            loop {
                if inner.active.lock().unwrap_or_else(|p| p.into_inner()).is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            let remaining = self.inner.active.lock().unwrap_or_else(|p| p.into_inner()).len();
            tracing::warn!(remaining, "drain timeout; forcing shutdown");
        }

        self.set_state(LifecycleState::Stopping);
        self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.set_state(LifecycleState::Stopped);
    }

    /// The public inference entry point: validate, admit, route with retry
    /// and deadlines, and return the token stream.
    pub async fn handle_inference_request(
        &self,
        request: InferenceRequest,
    ) -> Result<TokenStream, InferenceError> {
        if self.state() != LifecycleState::Ready {
            return Err(InferenceError::internal(format!(
                "controller not ready (currently {:?})",
                self.state()
            )));
        }
        request.validate()?;

        let inner = &self.inner;
        let request_id = request.request_id.clone();
        inner.metadata.create(&request_id);

        let permit = match inner.scheduler.admit(&request).await {
            Ok(permit) => permit,
            Err(err) => {
                inner.metadata.finalize(&request_id, Some(err.code()));
                return Err(err);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        inner.active.lock().unwrap_or_else(|p| p.into_inner()).insert(
            request_id.clone(),
            ActiveRequest { worker_id: None, cancel: cancel_tx },
        );

        let request = Arc::new(request);
        let attempt_request = Arc::clone(&request);
        let controller = self.clone();
        let result = inner
            .retry
            .execute(&request_id, move |excluded, attempt| {
                let controller = controller.clone();
                let request = Arc::clone(&attempt_request);
                async move { controller.route_attempt(&request, excluded, attempt).await }
            })
            .await;

        match result {
            Ok(success) => {
                let worker_id = success.worker.worker_id.clone();
                inner
                    .active
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .entry(request_id.clone())
                    .and_modify(|a| a.worker_id = Some(worker_id.clone()));
                let (sender, receiver) = mpsc::channel(TOKEN_CHANNEL_BUFFER);
                let pump = self.clone();
                tokio::spawn(async move {
                    pump.pump_stream(request, success, permit, sender, cancel_rx).await;
                });
                Ok(TokenStream { request_id, receiver })
            }
            Err(err) => {
                self.finish_request(&request_id, permit, None, Some(&err), 0, None);
                Err(err)
            }
        }
    }

    /// Cancel a request wherever it currently lives: scheduler queue, the
    /// active set, and any stream registered under its id.
    pub async fn cancel(&self, request_id: &str) {
        let inner = &self.inner;
        let was_queued = inner.scheduler.cancel(request_id);
        // Signal the pump, which owns the terminal bookkeeping; removing the
        // entry here keeps a second cancel from finding anything.
        let active =
            inner.active.lock().unwrap_or_else(|p| p.into_inner()).remove(request_id);
        if let Some(active) = &active {
            let _ = active.cancel.send(true);
        }
        if inner.streaming.has_stream(request_id) {
            let _ = inner.streaming.unregister_stream(request_id).await;
        }
        if was_queued || active.is_some() {
            inner.metadata.finalize(request_id, Some("CANCELLED"));
            tracing::info!(request_id, was_queued, "request cancelled");
        }
    }

    /// One routing attempt: snapshot, filter, select, dispatch, and wait
    /// for the first worker notification under the attempt deadline.
    async fn route_attempt(
        &self,
        request: &InferenceRequest,
        excluded: HashSet<String>,
        attempt: u32,
    ) -> Result<AttemptSuccess, AttemptFailure> {
        let inner = &self.inner;
        let known = inner.registry.len();
        let online = inner.registry.get_online();
        if online.is_empty() {
            return Err(AttemptFailure::unrouted(InferenceError::NoHealthyWorkers {
                online: 0,
                known,
            }));
        }

        if online.iter().all(|w| excluded.contains(&w.worker_id)) {
            // Routing is exhausted; surface it now instead of burning the
            // remaining retry budget.
            return Err(AttemptFailure::unrouted(InferenceError::NoWorkersAvailable {
                model_id: request.model_id.clone(),
            }));
        }

        let pool: Vec<Worker> = online
            .iter()
            .filter(|w| !excluded.contains(&w.worker_id))
            .filter(|w| inner.breakers.get(&w.worker_id).can_make_request())
            .cloned()
            .collect();
        if pool.is_empty() {
            return Err(AttemptFailure::unrouted(InferenceError::NoHealthyWorkers {
                online: online.len(),
                known,
            }));
        }

        let worker = inner
            .balancer
            .select(&pool, request)
            .map_err(AttemptFailure::unrouted)?;
        let worker_id = worker.worker_id.clone();

        let breaker = inner.breakers.get(&worker_id);
        if !breaker.try_acquire() {
            inner.metadata.update(&request.request_id, |m| m.circuit_breaker_trips += 1);
            return Err(AttemptFailure::new(
                InferenceError::CircuitBreakerOpen {
                    worker_id: worker_id.clone(),
                    failure_count: breaker.failure_count(),
                },
                Some(worker_id),
            ));
        }

        inner.metadata.update(&request.request_id, |m| {
            m.retry_count = attempt;
            m.selected_worker = Some(worker_id.clone());
        });
        tracing::debug!(
            request_id = %request.request_id,
            worker_id = %worker_id,
            attempt,
            "dispatching to worker"
        );

        let dispatch = self.dispatch_and_await_first(request, &worker_id);
        let outcome = inner
            .deadlines
            .enforce("dispatch", &request.request_id, request.stream, dispatch)
            .await;

        match outcome {
            Ok((subscription, first_event)) => {
                breaker.record_success();
                inner.registry.record_dispatch(&worker_id);
                Ok(AttemptSuccess { worker, subscription, first_event })
            }
            Err(err) => {
                breaker.record_failure();
                inner.metadata.update(&request.request_id, |m| {
                    m.failed_workers.push(worker_id.clone());
                    if err.is_timeout() {
                        m.timeouts += 1;
                    }
                });
                Err(AttemptFailure::new(err, Some(worker_id)))
            }
        }
    }

    /// Subscribe to the reply topic, publish the request, and wait for the
    /// worker's first notification. Dropping this future (deadline expiry or
    /// cancellation) abandons the subscription, which unsubscribes.
    async fn dispatch_and_await_first(
        &self,
        request: &InferenceRequest,
        worker_id: &str,
    ) -> Result<(BusSubscription, ResponseEvent), InferenceError> {
        let inner = &self.inner;
        let reply_topic = protocol::response_topic(&request.request_id);
        let mut subscription = inner.bus.subscribe(&reply_topic).await?;

        let payload = serde_json::to_value(request)
            .map_err(|e| InferenceError::internal(format!("request serialization: {e}")))?;
        inner.bus.publish(&protocol::inference_topic(worker_id), payload).await?;

        loop {
            let Some(raw) = subscription.recv().await else {
                return Err(InferenceError::WorkerUnavailable {
                    worker_id: worker_id.to_string(),
                    reason: "reply channel closed before first notification".into(),
                });
            };
            match serde_json::from_value::<ResponseEvent>(raw) {
                Ok(ResponseEvent::Error { error, code, .. }) => {
                    return Err(map_worker_error(&code, error, worker_id));
                }
                Ok(event) => return Ok((subscription, event)),
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "malformed reply event; skipping");
                }
            }
        }
    }

    /// Forward worker notifications to the client until done, error, or
    /// cancellation, then finalize bookkeeping.
    async fn pump_stream(
        &self,
        request: Arc<InferenceRequest>,
        success: AttemptSuccess,
        permit: SchedulerPermit,
        sender: mpsc::Sender<StreamEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let inner = &self.inner;
        let request_id = request.request_id.clone();
        let worker_id = success.worker.worker_id.clone();
        let mut subscription = success.subscription;
        let start_ms =
            inner.metadata.get(&request_id).map(|m| m.start_ms).unwrap_or_else(|| {
                inner.clock.now_millis()
            });

        let mut tokens_forwarded: u64 = 0;
        let mut ttft_ms: Option<u64> = None;
        let mut next_event = Some(success.first_event);
        let outcome: Result<(u64, u64), InferenceError> = loop {
            let event = match next_event.take() {
                Some(event) => Some(event),
                None => tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break Err(InferenceError::cancelled("request cancelled"));
                        }
                        continue;
                    }
                    raw = subscription.recv() => match raw {
                        None => None,
                        Some(raw) => match serde_json::from_value::<ResponseEvent>(raw) {
                            Ok(event) => Some(event),
                            Err(e) => {
                                tracing::warn!(request_id = %request_id, error = %e, "malformed reply event; skipping");
                                continue;
                            }
                        },
                    },
                },
            };
            match event {
                Some(ResponseEvent::Token { token, .. }) => {
                    ttft_ms.get_or_insert_with(|| {
                        inner.clock.now_millis().saturating_sub(start_ms)
                    });
                    tokens_forwarded += 1;
                    if sender.send(StreamEvent::Token(token.text)).await.is_err() {
                        break Err(InferenceError::cancelled("consumer dropped the stream"));
                    }
                }
                Some(ResponseEvent::Done { total_tokens, latency_ms, .. }) => {
                    break Ok((total_tokens, latency_ms));
                }
                Some(ResponseEvent::Error { error, code, .. }) => {
                    break Err(map_worker_error(&code, error, &worker_id));
                }
                None => {
                    break Err(InferenceError::WorkerUnavailable {
                        worker_id: worker_id.clone(),
                        reason: "reply channel closed mid-stream".into(),
                    });
                }
            }
        };

        match outcome {
            Ok((total_tokens, latency_ms)) => {
                let _ = sender.send(StreamEvent::Done { total_tokens, latency_ms }).await;
                self.finish_request(
                    &request_id,
                    permit,
                    Some(&worker_id),
                    None,
                    total_tokens.max(tokens_forwarded),
                    ttft_ms,
                );
            }
            Err(err) => {
                let _ = sender.send(StreamEvent::Error(err.clone())).await;
                self.finish_request(
                    &request_id,
                    permit,
                    Some(&worker_id),
                    Some(&err),
                    tokens_forwarded,
                    ttft_ms,
                );
            }
        }
    }

    /// Terminal bookkeeping shared by the success and failure paths.
    fn finish_request(
        &self,
        request_id: &str,
        permit: SchedulerPermit,
        worker_id: Option<&str>,
        error: Option<&InferenceError>,
        tokens: u64,
        ttft_ms: Option<u64>,
    ) {
        let inner = &self.inner;
        inner.active.lock().unwrap_or_else(|p| p.into_inner()).remove(request_id);
        if let Some(worker_id) = worker_id {
            inner.registry.record_completion(worker_id);
        }
        inner.metadata.finalize(request_id, error.map(|e| e.code()));
        permit.complete();

        let now = inner.clock.now_millis();
        let duration_ms = inner
            .metadata
            .get(request_id)
            .and_then(|m| m.duration_ms)
            .unwrap_or(0);
        inner.detector.record(RegressionSample {
            at_ms: now,
            duration_ms,
            ttft_ms,
            tokens,
            success: error.is_none(),
        });
        match error {
            Some(err) => {
                tracing::info!(request_id, code = err.code(), "request failed")
            }
            None => tracing::debug!(request_id, tokens, "request complete"),
        }
    }

    fn spawn_control_pump(&self, label: &'static str, mut subscription: BusSubscription) -> TaskGuard {
        let controller = self.clone();
        TaskGuard::new(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                controller.apply_control_message(label, raw);
            }
            tracing::debug!(label, "control subscription closed");
        }))
    }

    fn apply_control_message(&self, label: &str, raw: Value) {
        let inner = &self.inner;
        let applied = match label {
            "register" => serde_json::from_value::<WorkerRegistration>(raw)
                .map(|registration| inner.registry.register(registration)),
            "heartbeat" => serde_json::from_value::<WorkerHeartbeat>(raw)
                .map(|heartbeat| inner.registry.heartbeat(heartbeat)),
            "deregister" => {
                serde_json::from_value::<WorkerDeregistration>(raw).map(|deregistration| {
                    inner.registry.deregister(&deregistration);
                    inner.breakers.remove(&deregistration.worker_id);
                    inner.balancer.forget_worker(&deregistration.worker_id);
                })
            }
            _ => Ok(()),
        };
        if let Err(e) = applied {
            tracing::warn!(label, error = %e, "malformed control message");
        }
    }

    /// Build the batch queue wired to dispatch over this controller's bus.
    pub fn batch_queue(&self) -> BatchQueue {
        BatchQueue::new(
            self.inner.config.batch.clone(),
            Arc::clone(&self.inner.clock),
            Arc::new(BusBatchDispatcher { controller: self.clone() }),
        )
    }

    pub fn events(&self) -> &ControlEvents {
        &self.inner.events
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    pub fn breakers(&self) -> &BreakerSet {
        &self.inner.breakers
    }

    pub fn streaming(&self) -> &StreamingController {
        &self.inner.streaming
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.inner.metadata
    }

    pub fn detector(&self) -> &RegressionDetector {
        &self.inner.detector
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn active_requests(&self) -> usize {
        self.inner.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Translate a worker-reported error code into the local taxonomy.
fn map_worker_error(code: &str, message: String, worker_id: &str) -> InferenceError {
    match code {
        "VALIDATION" => InferenceError::Validation { field: "request", reason: message },
        "MODEL_NOT_FOUND" | "UNKNOWN_MODEL" => {
            InferenceError::Validation { field: "modelId", reason: message }
        }
        "CANCELLED" => InferenceError::cancelled(message),
        "WORKER_UNAVAILABLE" => {
            InferenceError::WorkerUnavailable { worker_id: worker_id.to_string(), reason: message }
        }
        _ => InferenceError::internal(format!("worker `{worker_id}`: {message}")),
    }
}

/// Batched RPCs ride the bus as one request/reply exchange against the
/// least-loaded online worker.
struct BusBatchDispatcher {
    controller: Controller,
}

#[async_trait::async_trait]
impl BatchDispatcher for BusBatchDispatcher {
    async fn dispatch(
        &self,
        kind: BatchKind,
        payloads: Vec<Value>,
    ) -> Result<Vec<Result<Value, InferenceError>>, InferenceError> {
        let inner = &self.controller.inner;
        let online = inner.registry.get_online();
        let worker = online
            .iter()
            .filter(|w| inner.breakers.get(&w.worker_id).can_make_request())
            .min_by_key(|w| w.metrics.active_requests)
            .ok_or(InferenceError::NoHealthyWorkers { online: 0, known: inner.registry.len() })?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let reply_topic = format!("response.batch.{batch_id}");
        let mut subscription = inner.bus.subscribe(&reply_topic).await?;
        inner
            .bus
            .publish(
                &protocol::batch_topic(&worker.worker_id, kind),
                json!({
                    "batchId": batch_id,
                    "kind": kind.as_str(),
                    "entries": payloads,
                }),
            )
            .await?;

        let reply = inner
            .deadlines
            .enforce("batch_dispatch", &batch_id, false, async {
                subscription.recv().await.ok_or_else(|| InferenceError::WorkerUnavailable {
                    worker_id: worker.worker_id.clone(),
                    reason: "batch reply channel closed".into(),
                })
            })
            .await?;

        let results = reply
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| InferenceError::internal("malformed batch reply"))?;
        Ok(results
            .iter()
            .map(|entry| {
                if let Some(err) = entry.get("error") {
                    Err(InferenceError::internal(
                        err.as_str().unwrap_or("batch entry failed").to_string(),
                    ))
                } else {
                    Ok(entry.get("ok").cloned().unwrap_or(Value::Null))
                }
            })
            .collect())
    }
}
