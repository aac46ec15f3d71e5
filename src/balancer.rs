//! Smart load balancing over the healthy worker pool.
//!
//! Selection order: session affinity, model eligibility, then a composite
//! score of in-flight load (primary), tier fit, and rolling latency, with a
//! round-robin cursor breaking exact ties so equal workers share load.

use crate::clock::Clock;
use crate::config::BalancerConfig;
use crate::error::InferenceError;
use crate::protocol::InferenceRequest;
use crate::registry::Worker;
use crate::tasks::TaskGuard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct AffinityEntry {
    worker_id: String,
    expires_at_ms: u64,
}

/// Chooses one worker per request from a pre-filtered healthy pool.
///
/// Cloning yields another handle onto the same affinity table and cursor.
#[derive(Clone)]
pub struct SmartBalancer {
    config: BalancerConfig,
    clock: Arc<dyn Clock>,
    affinity: Arc<Mutex<HashMap<String, AffinityEntry>>>,
    rr_cursor: Arc<AtomicUsize>,
}

impl SmartBalancer {
    pub fn new(config: BalancerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            affinity: Arc::new(Mutex::new(HashMap::new())),
            rr_cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pick a worker for `request` out of `pool`.
    ///
    /// `pool` is the healthy snapshot already narrowed by breaker state and
    /// the retry executor's excluded set; an empty pool means routing is
    /// exhausted for this attempt.
    pub fn select(&self, pool: &[Worker], request: &InferenceRequest) -> Result<Worker, InferenceError> {
        if pool.is_empty() {
            return Err(InferenceError::NoWorkersAvailable { model_id: request.model_id.clone() });
        }

        let eligible = self.eligible(pool, &request.model_id)?;

        if let Some(worker) = self.sticky_lookup(&eligible, request) {
            return Ok(worker);
        }

        let chosen = self.best_scored(&eligible);
        self.remember_affinity(request, &chosen.worker_id);
        Ok(chosen)
    }

    /// Workers declaring the model, or the whole pool when configured to
    /// fall back and nobody declares it.
    fn eligible(&self, pool: &[Worker], model_id: &str) -> Result<Vec<Worker>, InferenceError> {
        let declared: Vec<Worker> =
            pool.iter().filter(|w| w.serves_model(model_id)).cloned().collect();
        if !declared.is_empty() {
            return Ok(declared);
        }
        if self.config.fallback_to_all {
            tracing::debug!(model_id, "no worker declares model; falling back to full pool");
            return Ok(pool.to_vec());
        }
        Err(InferenceError::NoWorkersAvailable { model_id: model_id.to_string() })
    }

    fn sticky_lookup(&self, eligible: &[Worker], request: &InferenceRequest) -> Option<Worker> {
        if !self.config.session_affinity.enabled {
            return None;
        }
        let session_id = request.session_id.as_deref()?;
        let now = self.clock.now_millis();
        let mut affinity = self.affinity.lock().unwrap_or_else(|p| p.into_inner());
        let entry = affinity.get_mut(session_id)?;
        if entry.expires_at_ms <= now {
            affinity.remove(session_id);
            return None;
        }
        let worker = eligible.iter().find(|w| w.worker_id == entry.worker_id)?.clone();
        entry.expires_at_ms = now + self.config.session_affinity.ttl_ms;
        tracing::debug!(session_id, worker_id = %worker.worker_id, "session affinity hit");
        Some(worker)
    }

    fn remember_affinity(&self, request: &InferenceRequest, worker_id: &str) {
        if !self.config.session_affinity.enabled {
            return;
        }
        if let Some(session_id) = request.session_id.as_deref() {
            let expires_at_ms = self.clock.now_millis() + self.config.session_affinity.ttl_ms;
            self.affinity.lock().unwrap_or_else(|p| p.into_inner()).insert(
                session_id.to_string(),
                AffinityEntry { worker_id: worker_id.to_string(), expires_at_ms },
            );
        }
    }

    /// Composite score: fewest in-flight requests first, then the least
    /// over-provisioned tier, then lowest rolling latency. Exact ties
    /// rotate through the round-robin cursor.
    fn best_scored(&self, eligible: &[Worker]) -> Worker {
        let key = |w: &Worker| {
            (
                w.metrics.active_requests,
                w.capabilities.tiers.iter().map(|t| t.rank()).max().unwrap_or(0),
                w.metrics.avg_latency_ms as u64,
            )
        };
        let best = eligible.iter().map(key).min().expect("eligible pool is non-empty");
        let ties: Vec<&Worker> = eligible.iter().filter(|w| key(w) == best).collect();
        let index = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % ties.len();
        ties[index].clone()
    }

    /// Current sticky worker for a session, if any and not expired.
    pub fn sticky_worker(&self, session_id: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let affinity = self.affinity.lock().unwrap_or_else(|p| p.into_inner());
        affinity
            .get(session_id)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.worker_id.clone())
    }

    /// Drop every affinity entry pinned to a worker (used when it departs).
    pub fn forget_worker(&self, worker_id: &str) {
        self.affinity
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, entry| entry.worker_id != worker_id);
    }

    /// Remove expired affinity entries.
    pub fn evict_expired(&self) {
        let now = self.clock.now_millis();
        let mut affinity = self.affinity.lock().unwrap_or_else(|p| p.into_inner());
        let before = affinity.len();
        affinity.retain(|_, entry| entry.expires_at_ms > now);
        let evicted = before - affinity.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired session affinity entries");
        }
    }

    /// Spawn the periodic affinity eviction task.
    pub fn spawn_affinity_cleanup(&self) -> TaskGuard {
        let balancer = self.clone();
        let interval = Duration::from_millis(self.config.session_affinity.cleanup_interval_ms.max(1));
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                balancer.evict_expired();
            }
        }))
    }
}
