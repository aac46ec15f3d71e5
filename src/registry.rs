//! Worker registry and health monitor.
//!
//! Tracks every known worker, applies heartbeat timeouts, and hands the
//! router stable snapshots of the routing pool. All mutation serializes
//! under one mutex; listings clone, so nothing iterates under the write lock.

use crate::clock::Clock;
use crate::config::{DiscoveryConfig, StaticWorker};
use crate::events::{ControlEvent, ControlEvents};
use crate::protocol::{
    WorkerCapabilities, WorkerDeregistration, WorkerHeartbeat, WorkerMetrics, WorkerRegistration,
    WorkerSkills, WorkerStatus,
};
use crate::tasks::TaskGuard;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One known worker. Cloned out of the registry for routing decisions.
#[derive(Debug, Clone)]
pub struct Worker {
    pub worker_id: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub skills: WorkerSkills,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub last_heartbeat_ms: u64,
    pub metrics: WorkerMetrics,
}

impl Worker {
    pub fn is_online(&self) -> bool {
        self.status == WorkerStatus::Online
    }

    pub fn serves_model(&self, model_id: &str) -> bool {
        self.skills.available_models.iter().any(|m| m == model_id)
    }
}

/// Registry of workers, keyed by worker id. At most one record per id.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<HashMap<String, Worker>>>,
    clock: Arc<dyn Clock>,
    config: DiscoveryConfig,
    events: ControlEvents,
}

impl WorkerRegistry {
    pub fn new(config: DiscoveryConfig, clock: Arc<dyn Clock>, events: ControlEvents) -> Self {
        let registry = Self { inner: Arc::new(Mutex::new(HashMap::new())), clock, config, events };
        registry.seed_static();
        registry
    }

    /// Statically configured workers start online with empty skills until a
    /// real registration replaces them.
    fn seed_static(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for w in &self.config.static_workers {
            inner.insert(w.worker_id.clone(), Self::from_static(w, now));
        }
        if !self.config.static_workers.is_empty() {
            tracing::info!(count = self.config.static_workers.len(), "seeded static workers");
        }
    }

    fn from_static(w: &StaticWorker, now: u64) -> Worker {
        Worker {
            worker_id: w.worker_id.clone(),
            hostname: w.hostname.clone(),
            address: w.ip.clone(),
            port: w.port,
            skills: WorkerSkills::default(),
            capabilities: WorkerCapabilities::default(),
            status: WorkerStatus::Online,
            last_heartbeat_ms: now,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Upsert from a registration message, replacing any prior record.
    pub fn register(&self, registration: WorkerRegistration) {
        let now = self.clock.now_millis();
        let worker = Worker {
            worker_id: registration.worker_id.clone(),
            hostname: registration.hostname,
            address: registration.ip,
            port: registration.port,
            skills: registration.skills,
            capabilities: registration.capabilities,
            status: registration.status,
            last_heartbeat_ms: now,
            metrics: WorkerMetrics::default(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let replaced = inner.insert(registration.worker_id.clone(), worker).is_some();
        tracing::info!(worker_id = %registration.worker_id, replaced, "worker registered");
    }

    /// Update metrics and liveness from a heartbeat. Unknown workers are a
    /// logged no-op; the worker should re-register.
    pub fn heartbeat(&self, heartbeat: WorkerHeartbeat) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.get_mut(&heartbeat.worker_id) {
            Some(worker) => {
                worker.status = heartbeat.status;
                worker.metrics = heartbeat.metrics;
                worker.last_heartbeat_ms = now;
            }
            None => {
                tracing::warn!(worker_id = %heartbeat.worker_id, "heartbeat from unknown worker");
            }
        }
    }

    /// Remove immediately on explicit deregistration.
    pub fn deregister(&self, deregistration: &WorkerDeregistration) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.remove(&deregistration.worker_id).is_some() {
            tracing::info!(worker_id = %deregistration.worker_id, "worker deregistered");
        }
    }

    /// Force a worker offline, firing the offline event.
    pub fn mark_offline(&self, worker_id: &str) {
        let flipped = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            match inner.get_mut(worker_id) {
                Some(worker) if worker.status != WorkerStatus::Offline => {
                    worker.status = WorkerStatus::Offline;
                    Some(worker.last_heartbeat_ms)
                }
                _ => None,
            }
        };
        if let Some(last_heartbeat_ms) = flipped {
            tracing::warn!(worker_id = %worker_id, "worker marked offline");
            self.events.emit(ControlEvent::WorkerOffline {
                worker_id: worker_id.to_string(),
                last_heartbeat_ms,
            });
        }
    }

    /// Stable snapshot of every known worker.
    pub fn get_all(&self) -> Vec<Worker> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.values().cloned().collect()
    }

    /// Stable snapshot of the routing pool.
    pub fn get_online(&self) -> Vec<Worker> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.values().filter(|w| w.is_online()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Optimistic in-flight accounting between heartbeats, so the balancer
    /// sees dispatches it just made.
    pub fn record_dispatch(&self, worker_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(worker) = inner.get_mut(worker_id) {
            worker.metrics.active_requests = worker.metrics.active_requests.saturating_add(1);
        }
    }

    pub fn record_completion(&self, worker_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(worker) = inner.get_mut(worker_id) {
            worker.metrics.active_requests = worker.metrics.active_requests.saturating_sub(1);
            worker.metrics.total_requests_handled =
                worker.metrics.total_requests_handled.saturating_add(1);
        }
    }

    /// One liveness sweep: any worker with a stale heartbeat flips offline.
    pub fn sweep(&self) {
        let now = self.clock.now_millis();
        let timeout = self.config.offline_timeout_ms;
        let stale: Vec<(String, u64)> = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner
                .values_mut()
                .filter(|w| {
                    w.status != WorkerStatus::Offline
                        && now.saturating_sub(w.last_heartbeat_ms) > timeout
                })
                .map(|w| {
                    w.status = WorkerStatus::Offline;
                    (w.worker_id.clone(), w.last_heartbeat_ms)
                })
                .collect()
        };
        for (worker_id, last_heartbeat_ms) in stale {
            tracing::warn!(worker_id = %worker_id, "heartbeat timeout; worker offline");
            self.events.emit(ControlEvent::WorkerOffline { worker_id, last_heartbeat_ms });
        }
    }

    /// Spawn the periodic liveness sweep. The returned guard stops it.
    pub fn spawn_sweeper(&self) -> TaskGuard {
        let registry = self.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registration(worker_id: &str, models: &[&str]) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.into(),
            hostname: format!("{worker_id}.local"),
            ip: "127.0.0.1".into(),
            port: 9000,
            skills: WorkerSkills {
                available_models: models.iter().map(|m| m.to_string()).collect(),
                ..WorkerSkills::default()
            },
            capabilities: WorkerCapabilities::default(),
            status: WorkerStatus::Online,
            timestamp: 0,
        }
    }

    fn heartbeat(worker_id: &str) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: worker_id.into(),
            status: WorkerStatus::Online,
            metrics: WorkerMetrics { active_requests: 2, ..WorkerMetrics::default() },
            timestamp: 0,
        }
    }

    fn make_registry(clock: ManualClock) -> WorkerRegistry {
        WorkerRegistry::new(DiscoveryConfig::default(), Arc::new(clock), ControlEvents::new(16))
    }

    #[test]
    fn register_is_an_upsert() {
        let registry = make_registry(ManualClock::new());
        registry.register(registration("w1", &["a"]));
        registry.register(registration("w1", &["a", "b"]));

        let all = registry.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].skills.available_models, vec!["a", "b"]);
    }

    #[test]
    fn heartbeat_updates_known_worker_and_ignores_unknown() {
        let clock = ManualClock::new();
        let registry = make_registry(clock.clone());
        registry.register(registration("w1", &[]));

        clock.advance(1_000);
        registry.heartbeat(heartbeat("w1"));
        registry.heartbeat(heartbeat("ghost"));

        let all = registry.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metrics.active_requests, 2);
        assert_eq!(all[0].last_heartbeat_ms, 1_000);
    }

    #[test]
    fn sweep_flips_stale_workers_offline_and_fires_event() {
        let clock = ManualClock::new();
        let events = ControlEvents::new(16);
        let registry = WorkerRegistry::new(
            DiscoveryConfig { offline_timeout_ms: 15_000, ..DiscoveryConfig::default() },
            Arc::new(clock.clone()),
            events.clone(),
        );
        let mut rx = events.subscribe();
        registry.register(registration("w1", &[]));
        registry.register(registration("w2", &[]));

        clock.advance(10_000);
        registry.heartbeat(heartbeat("w2"));
        clock.advance(6_000); // w1 is now 16s stale, w2 only 6s
        registry.sweep();

        let online = registry.get_online();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].worker_id, "w2");
        match rx.try_recv().unwrap() {
            ControlEvent::WorkerOffline { worker_id, .. } => assert_eq!(worker_id, "w1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn sweep_is_idempotent_for_already_offline_workers() {
        let clock = ManualClock::new();
        let events = ControlEvents::new(16);
        let registry = WorkerRegistry::new(
            DiscoveryConfig::default(),
            Arc::new(clock.clone()),
            events.clone(),
        );
        let mut rx = events.subscribe();
        registry.register(registration("w1", &[]));
        clock.advance(60_000);
        registry.sweep();
        registry.sweep();

        assert!(rx.try_recv().is_ok(), "first sweep fires");
        assert!(rx.try_recv().is_err(), "second sweep does not re-fire");
    }

    #[test]
    fn deregister_removes_immediately() {
        let registry = make_registry(ManualClock::new());
        registry.register(registration("w1", &[]));
        registry.deregister(&WorkerDeregistration { worker_id: "w1".into(), timestamp: 0 });
        assert!(registry.is_empty());
    }

    #[test]
    fn static_workers_start_online_with_empty_skills() {
        let config = DiscoveryConfig {
            static_workers: vec![StaticWorker {
                worker_id: "s1".into(),
                hostname: "s1.local".into(),
                ip: "10.0.0.1".into(),
                port: 9000,
            }],
            ..DiscoveryConfig::default()
        };
        let registry =
            WorkerRegistry::new(config, Arc::new(ManualClock::new()), ControlEvents::new(4));
        let online = registry.get_online();
        assert_eq!(online.len(), 1);
        assert!(online[0].skills.available_models.is_empty());
    }

    #[test]
    fn dispatch_accounting_adjusts_active_requests() {
        let registry = make_registry(ManualClock::new());
        registry.register(registration("w1", &[]));
        registry.record_dispatch("w1");
        registry.record_dispatch("w1");
        registry.record_completion("w1");

        let w = &registry.get_all()[0];
        assert_eq!(w.metrics.active_requests, 1);
        assert_eq!(w.metrics.total_requests_handled, 1);
    }

    #[test]
    fn mark_offline_fires_once() {
        let clock = ManualClock::new();
        let events = ControlEvents::new(16);
        let registry =
            WorkerRegistry::new(DiscoveryConfig::default(), Arc::new(clock), events.clone());
        let mut rx = events.subscribe();
        registry.register(registration("w1", &[]));
        registry.mark_offline("w1");
        registry.mark_offline("w1");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
