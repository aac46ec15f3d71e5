//! Backoff schedules for the retry executor.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// `initial * multiplier^k` for attempt `k`, capped at `max`.
    Exponential { initial: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential { initial, multiplier, max }
    }

    /// Delay before retry number `attempt` (0-indexed: the delay after the
    /// first failed attempt is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { initial, multiplier, max } => {
                let factor = multiplier.max(1.0).powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64).min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(7), Duration::from_millis(100));
    }

    #[test]
    fn exponential_schedule_grows_by_multiplier() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn exponential_schedule_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 3.0, Duration::from_millis(500));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(300));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(20), Duration::from_millis(500));
    }

    #[test]
    fn exponential_never_overflows() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1), 10.0, Duration::from_secs(60));
        assert_eq!(backoff.delay(100), Duration::from_secs(60));
    }

    #[test]
    fn sub_unit_multiplier_is_clamped() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), 0.5, Duration::from_secs(1));
        // A shrinking schedule would hammer workers; multiplier clamps to 1.
        assert_eq!(backoff.delay(3), Duration::from_millis(100));
    }
}
