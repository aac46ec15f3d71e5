//! Rolling request metrics inside each worker.
//!
//! A bounded window of per-request samples backs the latency percentiles,
//! token throughput, and per-model averages that ride heartbeats back to
//! the controller and feed its load balancer.

use crate::clock::Clock;
use crate::protocol::WorkerMetrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const DEFAULT_WINDOW: usize = 1_000;
/// Requests/sec is measured over this trailing span.
const RATE_SPAN_MS: u64 = 60_000;

#[derive(Debug, Clone)]
struct Sample {
    latency_ms: u64,
    tokens: u64,
    model_id: String,
    at_ms: u64,
    success: bool,
}

/// Aggregated view over the sample window.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatsSnapshot {
    pub samples: usize,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub tokens_per_sec: f64,
    pub requests_per_sec: f64,
    pub error_rate: f64,
    pub per_model_avg_latency_ms: HashMap<String, f64>,
    pub total_requests: u64,
}

/// Sliding-window collector of request outcomes.
///
/// Cloning yields another handle onto the same window.
#[derive(Clone)]
pub struct MetricsCollector {
    window: Arc<Mutex<VecDeque<Sample>>>,
    total: Arc<Mutex<u64>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl MetricsCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_WINDOW)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            total: Arc::new(Mutex::new(0)),
            clock,
            capacity: capacity.max(1),
        }
    }

    /// Record one finished request.
    pub fn record(&self, latency_ms: u64, tokens: u64, model_id: &str, success: bool) {
        let sample = Sample {
            latency_ms,
            tokens,
            model_id: model_id.to_string(),
            at_ms: self.clock.now_millis(),
            success,
        };
        let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(sample);
        *self.total.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let total = *self.total.lock().unwrap_or_else(|p| p.into_inner());
        if window.is_empty() {
            return WorkerStatsSnapshot { total_requests: total, ..WorkerStatsSnapshot::default() };
        }
        let now = self.clock.now_millis();

        let mut latencies: Vec<u64> = window.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let percentile = |p: f64| -> u64 {
            let rank = ((latencies.len() as f64) * p).ceil() as usize;
            latencies[rank.clamp(1, latencies.len()) - 1]
        };

        let span_ms = {
            let first = window.front().map(|s| s.at_ms).unwrap_or(now);
            now.saturating_sub(first).max(1)
        };
        let tokens: u64 = window.iter().map(|s| s.tokens).sum();

        let recent_cutoff = now.saturating_sub(RATE_SPAN_MS);
        let recent = window.iter().filter(|s| s.at_ms >= recent_cutoff).count();

        let mut per_model: HashMap<String, (u64, u64)> = HashMap::new();
        for sample in window.iter() {
            let entry = per_model.entry(sample.model_id.clone()).or_insert((0, 0));
            entry.0 += sample.latency_ms;
            entry.1 += 1;
        }

        let errors = window.iter().filter(|s| !s.success).count();

        WorkerStatsSnapshot {
            samples: window.len(),
            p50_latency_ms: percentile(0.50),
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
            avg_latency_ms: latencies.iter().sum::<u64>() as f64 / latencies.len() as f64,
            tokens_per_sec: tokens as f64 * 1_000.0 / span_ms as f64,
            requests_per_sec: recent as f64 * 1_000.0 / RATE_SPAN_MS.min(span_ms).max(1) as f64,
            error_rate: errors as f64 / window.len() as f64,
            per_model_avg_latency_ms: per_model
                .into_iter()
                .map(|(model, (sum, count))| (model, sum as f64 / count as f64))
                .collect(),
            total_requests: total,
        }
    }

    /// Heartbeat payload fields derived from the current window.
    pub fn to_heartbeat_metrics(
        &self,
        active_requests: u32,
        models_loaded: Vec<String>,
    ) -> WorkerMetrics {
        let snapshot = self.snapshot();
        WorkerMetrics {
            cpu_usage_percent: 0.0,
            memory_used_gb: 0.0,
            gpu_utilization_percent: 0.0,
            active_requests,
            total_requests_handled: snapshot.total_requests,
            avg_latency_ms: snapshot.avg_latency_ms,
            models_loaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn empty_window_snapshot_is_zeroed() {
        let collector = MetricsCollector::new(Arc::new(ManualClock::new()));
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.p99_latency_ms, 0);
    }

    #[test]
    fn percentiles_come_from_the_window() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::new(Arc::new(clock.clone()));
        for latency in 1..=100 {
            collector.record(latency, 10, "m", true);
            clock.advance(10);
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.p50_latency_ms, 50);
        assert_eq!(snapshot.p95_latency_ms, 95);
        assert_eq!(snapshot.p99_latency_ms, 99);
        assert!((snapshot.avg_latency_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn window_is_bounded() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::with_capacity(Arc::new(clock.clone()), 10);
        for i in 0..25 {
            collector.record(i, 1, "m", true);
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.samples, 10, "window keeps the most recent samples");
        assert_eq!(snapshot.total_requests, 25, "lifetime counter keeps counting");
        assert_eq!(snapshot.p50_latency_ms, 20, "old samples aged out");
    }

    #[test]
    fn per_model_latency_is_averaged() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::new(Arc::new(clock.clone()));
        collector.record(100, 1, "fast-model", true);
        collector.record(200, 1, "fast-model", true);
        collector.record(1_000, 1, "slow-model", true);

        let snapshot = collector.snapshot();
        assert!((snapshot.per_model_avg_latency_ms["fast-model"] - 150.0).abs() < f64::EPSILON);
        assert!((snapshot.per_model_avg_latency_ms["slow-model"] - 1_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn token_throughput_uses_window_span() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::new(Arc::new(clock.clone()));
        collector.record(10, 100, "m", true);
        clock.advance(1_000);
        collector.record(10, 100, "m", true);

        let snapshot = collector.snapshot();
        // 200 tokens over 1 second.
        assert!((snapshot.tokens_per_sec - 200.0).abs() < 1.0);
    }

    #[test]
    fn error_rate_reflects_failures() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::new(Arc::new(clock.clone()));
        for i in 0..10 {
            collector.record(10, 1, "m", i % 5 != 0);
        }
        assert!((collector.snapshot().error_rate - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn heartbeat_metrics_carry_window_numbers() {
        let clock = ManualClock::new();
        let collector = MetricsCollector::new(Arc::new(clock.clone()));
        collector.record(40, 10, "m", true);
        collector.record(60, 10, "m", true);

        let metrics = collector.to_heartbeat_metrics(3, vec!["m".into()]);
        assert_eq!(metrics.active_requests, 3);
        assert_eq!(metrics.total_requests_handled, 2);
        assert!((metrics.avg_latency_ms - 50.0).abs() < f64::EPSILON);
        assert_eq!(metrics.models_loaded, vec!["m"]);
    }
}
