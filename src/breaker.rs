//! Per-worker circuit breakers.
//!
//! Lock-free three-state breakers guard every worker. State transitions go
//! through compare-and-swap so concurrent routing attempts agree on who
//! performed a transition; counters reset only as part of a transition.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::events::{ControlEvent, ControlEvents};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CLOSED => BreakerState::Closed,
            STATE_OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }
}

/// Point-in-time view of one breaker, for operational inspection.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub worker_id: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at_ms: u64,
    pub last_failure_ms: u64,
    pub last_success_ms: u64,
}

/// Breaker for a single worker.
pub struct CircuitBreaker {
    worker_id: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: ControlEvents,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    half_open_in_flight: AtomicU32,
    opened_at_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    last_success_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(
        worker_id: String,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        events: ControlEvents,
    ) -> Self {
        Self {
            worker_id,
            config,
            clock,
            events,
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Whether a request may be routed to this worker right now.
    ///
    /// Open breakers whose timeout has elapsed transition to half-open here,
    /// so the first caller after the cool-down gets the probe slot. This is
    /// a query, not a reservation; [`CircuitBreaker::try_acquire`] reserves.
    pub fn can_make_request(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CLOSED => return true,
                STATE_OPEN => {
                    let opened = self.opened_at_ms.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened);
                    if elapsed < self.config.timeout_ms {
                        return false;
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.success_count.store(0, Ordering::Release);
                            self.half_open_in_flight.store(0, Ordering::Release);
                            tracing::info!(worker_id = %self.worker_id, "breaker half-open");
                            self.emit_transition(BreakerState::Open, BreakerState::HalfOpen);
                            return true;
                        }
                        // Someone else transitioned; re-evaluate.
                        Err(_) => continue,
                    }
                }
                _ => {
                    return self.half_open_in_flight.load(Ordering::Acquire)
                        < self.config.success_threshold;
                }
            }
        }
    }

    /// Reserve the right to dispatch one request. In half-open this takes a
    /// probe slot; callers must pair it with `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&self) -> bool {
        if !self.can_make_request() {
            return false;
        }
        if self.state.load(Ordering::Acquire) != STATE_HALF_OPEN {
            return true;
        }
        loop {
            let current = self.half_open_in_flight.load(Ordering::Acquire);
            if current >= self.config.success_threshold {
                return false;
            }
            if self
                .half_open_in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn record_success(&self) {
        self.last_success_ms.store(self.clock.now_millis(), Ordering::Release);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.failure_count.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                self.half_open_in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                })
                .ok();
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.failure_count.store(0, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    self.opened_at_ms.store(0, Ordering::Release);
                    tracing::info!(worker_id = %self.worker_id, "breaker closed");
                    self.emit_transition(BreakerState::HalfOpen, BreakerState::Closed);
                }
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        self.last_failure_ms.store(now, Ordering::Release);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.opened_at_ms.store(now, Ordering::Release);
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        failures,
                        threshold = self.config.failure_threshold,
                        "breaker open"
                    );
                    self.emit_transition(BreakerState::Closed, BreakerState::Open);
                }
            }
            STATE_HALF_OPEN => {
                self.half_open_in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                })
                .ok();
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at_ms.store(now, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    tracing::warn!(worker_id = %self.worker_id, "probe failed; breaker re-open");
                    self.emit_transition(BreakerState::HalfOpen, BreakerState::Open);
                }
            }
            _ => {
                // Failures while open keep the count for observability.
                self.failure_count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Reset to closed, clearing all counters.
    pub fn reset(&self) {
        let previous = BreakerState::from_raw(self.state.swap(STATE_CLOSED, Ordering::AcqRel));
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_in_flight.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
        if previous != BreakerState::Closed {
            self.emit_transition(previous, BreakerState::Closed);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            worker_id: self.worker_id.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            opened_at_ms: self.opened_at_ms.load(Ordering::Acquire),
            last_failure_ms: self.last_failure_ms.load(Ordering::Acquire),
            last_success_ms: self.last_success_ms.load(Ordering::Acquire),
        }
    }

    fn emit_transition(&self, from: BreakerState, to: BreakerState) {
        self.events.emit(ControlEvent::BreakerTransition {
            worker_id: self.worker_id.clone(),
            from,
            to,
        });
    }
}

/// Lazily populated set of breakers, one per worker id.
pub struct BreakerSet {
    inner: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: ControlEvents,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, events: ControlEvents) -> Self {
        Self { inner: Mutex::new(HashMap::new()), config, clock, events }
    }

    /// Breaker for a worker, created closed on first access.
    pub fn get(&self, worker_id: &str) -> Arc<CircuitBreaker> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    worker_id.to_string(),
                    self.config.clone(),
                    Arc::clone(&self.clock),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Remove the breaker for a departed worker.
    pub fn remove(&self, worker_id: &str) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).remove(worker_id);
    }

    /// Sorted snapshot of every breaker's state.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<BreakerStats> = inner.values().map(|b| b.stats()).collect();
        entries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        entries
    }
}
