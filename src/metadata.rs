//! Per-request trace metadata and regression detection.
//!
//! Every request gets a metadata record at admission, mutated only while the
//! request is in flight and frozen at its terminal state. Records are kept
//! for a retention window so operators can inspect recent failures, then
//! evicted. A rolling regression detector watches throughput, TTFT, and
//! error rate against a captured baseline and raises critical alerts.

use crate::clock::Clock;
use crate::config::MetadataConfig;
use crate::events::{AlertSeverity, ControlEvent, ControlEvents, RegressionMetric};
use crate::tasks::TaskGuard;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trace of one request through the control plane.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub request_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub selected_worker: Option<String>,
    pub failed_workers: Vec<String>,
    pub circuit_breaker_trips: u32,
    pub timeouts: u32,
    pub final_error: Option<String>,
    frozen: bool,
}

impl RequestMetadata {
    pub fn is_terminal(&self) -> bool {
        self.frozen
    }
}

/// Store of request traces with retention-based eviction.
///
/// Cloning yields another handle onto the same store.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<Mutex<HashMap<String, RequestMetadata>>>,
    clock: Arc<dyn Clock>,
    retention_ms: u64,
}

impl MetadataStore {
    pub fn new(config: &MetadataConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            clock,
            retention_ms: config.retention_ms,
        }
    }

    /// Create the record at admission. Replaces any stale record under the
    /// same id.
    pub fn create(&self, request_id: &str) {
        let record = RequestMetadata {
            request_id: request_id.to_string(),
            start_ms: self.clock.now_millis(),
            ..RequestMetadata::default()
        };
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).insert(request_id.to_string(), record);
    }

    /// Mutate an in-flight record. Terminal records are left untouched.
    pub fn update<F>(&self, request_id: &str, mutate: F)
    where
        F: FnOnce(&mut RequestMetadata),
    {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = inner.get_mut(request_id) {
            if !record.frozen {
                mutate(record);
            }
        }
    }

    /// Freeze the record at its terminal state.
    pub fn finalize(&self, request_id: &str, final_error: Option<&str>) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = inner.get_mut(request_id) {
            if !record.frozen {
                record.end_ms = Some(now);
                record.duration_ms = Some(now.saturating_sub(record.start_ms));
                record.final_error = final_error.map(str::to_string);
                record.frozen = true;
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestMetadata> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(request_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict terminal records older than the retention window.
    pub fn evict_expired(&self) {
        let now = self.clock.now_millis();
        let retention = self.retention_ms;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.len();
        inner.retain(|_, record| match record.end_ms {
            Some(end) if record.frozen => now.saturating_sub(end) <= retention,
            _ => true,
        });
        let evicted = before - inner.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired request metadata");
        }
    }

    /// Spawn periodic retention eviction, sweeping at half the window.
    pub fn spawn_retention(&self) -> TaskGuard {
        let store = self.clone();
        let interval = Duration::from_millis((self.retention_ms / 2).max(1_000));
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.evict_expired();
            }
        }))
    }
}

/// One completed-request observation fed to the detector.
#[derive(Debug, Clone, Copy)]
pub struct RegressionSample {
    pub at_ms: u64,
    pub duration_ms: u64,
    pub ttft_ms: Option<u64>,
    pub tokens: u64,
    pub success: bool,
}

/// Captured healthy-state reference values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub throughput_tps: f64,
    pub ttft_ms: f64,
}

#[derive(Default)]
struct DetectorWindow {
    samples: VecDeque<RegressionSample>,
}

/// Rolling comparison of live metrics against a baseline.
///
/// Thresholds: throughput down 5 %, TTFT up 10 %, or error rate above 1 %
/// raise a critical alert once the window holds enough samples.
#[derive(Clone)]
pub struct RegressionDetector {
    window: Arc<Mutex<DetectorWindow>>,
    baseline: Arc<Mutex<Option<Baseline>>>,
    events: ControlEvents,
    min_samples: usize,
    rollback_on_critical: bool,
    window_cap: usize,
}

const THROUGHPUT_DROP: f64 = 0.05;
const TTFT_RISE: f64 = 0.10;
const ERROR_RATE_LIMIT: f64 = 0.01;
const DEFAULT_WINDOW_CAP: usize = 1_000;

impl RegressionDetector {
    pub fn new(config: &MetadataConfig, events: ControlEvents) -> Self {
        Self {
            window: Arc::new(Mutex::new(DetectorWindow::default())),
            baseline: Arc::new(Mutex::new(None)),
            events,
            min_samples: config.min_samples_for_evaluation,
            rollback_on_critical: config.rollback_on_critical,
            window_cap: DEFAULT_WINDOW_CAP,
        }
    }

    /// Fix the reference values that later samples are judged against.
    pub fn set_baseline(&self, baseline: Baseline) {
        *self.baseline.lock().unwrap_or_else(|p| p.into_inner()) = Some(baseline);
        tracing::info!(
            throughput_tps = baseline.throughput_tps,
            ttft_ms = baseline.ttft_ms,
            "regression baseline set"
        );
    }

    /// Capture the current window as the baseline.
    pub fn capture_baseline(&self) -> Option<Baseline> {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let baseline = Self::aggregate(&window.samples)?;
        drop(window);
        self.set_baseline(baseline);
        Some(baseline)
    }

    /// Record one completed request and evaluate the thresholds.
    pub fn record(&self, sample: RegressionSample) {
        {
            let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
            if window.samples.len() == self.window_cap {
                window.samples.pop_front();
            }
            window.samples.push_back(sample);
        }
        self.evaluate();
    }

    fn aggregate(samples: &VecDeque<RegressionSample>) -> Option<Baseline> {
        if samples.is_empty() {
            return None;
        }
        let span_ms = {
            let first = samples.front()?.at_ms;
            let last = samples.back()?.at_ms;
            last.saturating_sub(first).max(1)
        };
        let tokens: u64 = samples.iter().map(|s| s.tokens).sum();
        let ttfts: Vec<u64> = samples.iter().filter_map(|s| s.ttft_ms).collect();
        Some(Baseline {
            throughput_tps: tokens as f64 * 1_000.0 / span_ms as f64,
            ttft_ms: if ttfts.is_empty() {
                0.0
            } else {
                ttfts.iter().sum::<u64>() as f64 / ttfts.len() as f64
            },
        })
    }

    fn evaluate(&self) {
        let baseline = match *self.baseline.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(b) => b,
            None => return,
        };
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        if window.samples.len() < self.min_samples {
            return;
        }
        let Some(current) = Self::aggregate(&window.samples) else { return };
        let errors = window.samples.iter().filter(|s| !s.success).count();
        let error_rate = errors as f64 / window.samples.len() as f64;
        drop(window);

        if baseline.throughput_tps > 0.0
            && current.throughput_tps < baseline.throughput_tps * (1.0 - THROUGHPUT_DROP)
        {
            self.alert(RegressionMetric::Throughput, current.throughput_tps, baseline.throughput_tps);
        }
        if baseline.ttft_ms > 0.0 && current.ttft_ms > baseline.ttft_ms * (1.0 + TTFT_RISE) {
            self.alert(RegressionMetric::TimeToFirstToken, current.ttft_ms, baseline.ttft_ms);
        }
        if error_rate > ERROR_RATE_LIMIT {
            self.alert(RegressionMetric::ErrorRate, error_rate, ERROR_RATE_LIMIT);
        }
    }

    fn alert(&self, metric: RegressionMetric, observed: f64, baseline: f64) {
        tracing::error!(?metric, observed, baseline, "regression detected");
        self.events.emit(ControlEvent::Alert {
            metric,
            severity: AlertSeverity::Critical,
            observed,
            baseline,
        });
        if self.rollback_on_critical {
            self.events.emit(ControlEvent::RollbackRequested { metric });
        }
    }
}
