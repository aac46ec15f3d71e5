//! Hardware classification and usage reporting.
//!
//! A worker's GPU core count and memory decide which model tiers it may
//! advertise; the best tier also bounds its concurrency. Actual usage
//! numbers come from a caller-supplied probe so this crate stays free of
//! platform-specific sampling.

use crate::clock::Clock;
use crate::protocol::{ModelTier, WorkerCapabilities};
use std::sync::{Arc, Mutex};

/// Static description of the worker's hardware.
#[derive(Debug, Clone, Copy)]
pub struct HardwareProfile {
    pub gpu_cores: u32,
    pub memory_gb: f64,
    pub cpu_cores: u32,
}

impl HardwareProfile {
    /// Tier set this hardware can host. The smallest tier is always
    /// supported; each larger tier needs both more GPU cores and more
    /// memory.
    pub fn tiers(&self) -> Vec<ModelTier> {
        let mut tiers = vec![ModelTier::Under3B];
        let thresholds = [
            (ModelTier::Small, 10, 8.0),
            (ModelTier::Medium, 15, 16.0),
            (ModelTier::Large, 20, 32.0),
            (ModelTier::Huge, 30, 64.0),
        ];
        for (tier, min_cores, min_memory) in thresholds {
            if self.gpu_cores >= min_cores && self.memory_gb >= min_memory {
                tiers.push(tier);
            }
        }
        tiers
    }

    /// Concurrency ceiling derived from the best supported tier: big models
    /// leave room for fewer simultaneous generations.
    pub fn max_concurrent(&self) -> u32 {
        match self.tiers().last().copied().unwrap_or(ModelTier::Under3B) {
            ModelTier::Under3B => 6,
            ModelTier::Small => 4,
            ModelTier::Medium => 3,
            ModelTier::Large => 2,
            ModelTier::Huge => 1,
        }
    }

    /// Capabilities advertised in registration messages.
    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            max_concurrent: self.max_concurrent(),
            tiers: self.tiers(),
            available_memory_gb: self.memory_gb,
        }
    }
}

/// One usage reading from the platform probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSample {
    /// Cumulative CPU time consumed, in milliseconds.
    pub cpu_time_ms: u64,
    pub memory_used_gb: f64,
    pub gpu_utilization_percent: f64,
}

/// Platform-specific sampling seam; implemented by the embedding worker.
pub trait UsageProbe: Send + Sync {
    fn sample(&self) -> UsageSample;
}

struct LastReading {
    cpu_time_ms: u64,
    at_ms: u64,
}

/// Report of current utilization with CPU percent derived from the sliding
/// delta between consecutive probe readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageReport {
    pub cpu_usage_percent: f64,
    pub memory_used_gb: f64,
    pub gpu_utilization_percent: f64,
}

/// Periodic usage reporter with sliding CPU delta computation.
pub struct UsageReporter {
    probe: Arc<dyn UsageProbe>,
    clock: Arc<dyn Clock>,
    cpu_cores: u32,
    last: Mutex<Option<LastReading>>,
}

impl UsageReporter {
    pub fn new(probe: Arc<dyn UsageProbe>, clock: Arc<dyn Clock>, profile: &HardwareProfile) -> Self {
        Self { probe, clock, cpu_cores: profile.cpu_cores.max(1), last: Mutex::new(None) }
    }

    /// Sample the probe and compute utilization since the previous report.
    /// The first call has no delta to compare against and reports 0 % CPU.
    pub fn report(&self) -> UsageReport {
        let sample = self.probe.sample();
        let now = self.clock.now_millis();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());

        let cpu_usage_percent = match last.as_ref() {
            Some(previous) if now > previous.at_ms => {
                let cpu_delta = sample.cpu_time_ms.saturating_sub(previous.cpu_time_ms) as f64;
                let wall_delta = (now - previous.at_ms) as f64 * self.cpu_cores as f64;
                (cpu_delta / wall_delta * 100.0).min(100.0)
            }
            _ => 0.0,
        };
        *last = Some(LastReading { cpu_time_ms: sample.cpu_time_ms, at_ms: now });

        UsageReport {
            cpu_usage_percent,
            memory_used_gb: sample.memory_used_gb,
            gpu_utilization_percent: sample.gpu_utilization_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn tiny_hardware_gets_only_the_smallest_tier() {
        let profile = HardwareProfile { gpu_cores: 4, memory_gb: 4.0, cpu_cores: 4 };
        assert_eq!(profile.tiers(), vec![ModelTier::Under3B]);
        assert_eq!(profile.max_concurrent(), 6);
    }

    #[test]
    fn tier_thresholds_require_both_cores_and_memory() {
        // Enough cores for mid tiers but memory caps it at the small one.
        let profile = HardwareProfile { gpu_cores: 32, memory_gb: 8.0, cpu_cores: 8 };
        assert_eq!(profile.tiers(), vec![ModelTier::Under3B, ModelTier::Small]);
    }

    #[test]
    fn big_hardware_supports_every_tier() {
        let profile = HardwareProfile { gpu_cores: 38, memory_gb: 128.0, cpu_cores: 16 };
        let tiers = profile.tiers();
        assert_eq!(tiers.len(), 5);
        assert_eq!(*tiers.last().unwrap(), ModelTier::Huge);
        assert_eq!(profile.max_concurrent(), 1);
    }

    #[test]
    fn capabilities_mirror_the_profile() {
        let profile = HardwareProfile { gpu_cores: 16, memory_gb: 24.0, cpu_cores: 8 };
        let caps = profile.capabilities();
        assert_eq!(caps.tiers, profile.tiers());
        assert_eq!(caps.max_concurrent, profile.max_concurrent());
        assert!((caps.available_memory_gb - 24.0).abs() < f64::EPSILON);
    }

    struct FakeProbe {
        cpu_time_ms: AtomicU64,
    }

    impl UsageProbe for FakeProbe {
        fn sample(&self) -> UsageSample {
            UsageSample {
                cpu_time_ms: self.cpu_time_ms.load(Ordering::SeqCst),
                memory_used_gb: 12.5,
                gpu_utilization_percent: 40.0,
            }
        }
    }

    #[test]
    fn cpu_percent_comes_from_sliding_delta() {
        let clock = ManualClock::new();
        let probe = Arc::new(FakeProbe { cpu_time_ms: AtomicU64::new(0) });
        let profile = HardwareProfile { gpu_cores: 16, memory_gb: 32.0, cpu_cores: 2 };
        let reporter = UsageReporter::new(probe.clone(), Arc::new(clock.clone()), &profile);

        let first = reporter.report();
        assert_eq!(first.cpu_usage_percent, 0.0, "no delta on the first reading");

        // 1 core-second of CPU over 1s wall on 2 cores = 50%.
        probe.cpu_time_ms.store(1_000, Ordering::SeqCst);
        clock.advance(1_000);
        let second = reporter.report();
        assert!((second.cpu_usage_percent - 50.0).abs() < 0.01);
        assert!((second.memory_used_gb - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_saturates_at_100() {
        let clock = ManualClock::new();
        let probe = Arc::new(FakeProbe { cpu_time_ms: AtomicU64::new(0) });
        let profile = HardwareProfile { gpu_cores: 16, memory_gb: 32.0, cpu_cores: 1 };
        let reporter = UsageReporter::new(probe.clone(), Arc::new(clock.clone()), &profile);
        reporter.report();

        probe.cpu_time_ms.store(10_000, Ordering::SeqCst);
        clock.advance(1_000);
        assert_eq!(reporter.report().cpu_usage_percent, 100.0);
    }
}
