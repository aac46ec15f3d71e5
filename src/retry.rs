//! Retry executor for routing attempts.
//!
//! Retries always change worker: each failed attempt adds the worker it
//! touched to an excluded set that the next attempt must route around. The
//! backoff between attempts is `min(initial * multiplier^k, max)` with
//! optional jitter.

use crate::backoff::Backoff;
use crate::error::InferenceError;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::config::RetryConfig;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How one routing attempt failed, and on which worker.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: InferenceError,
    /// Worker the attempt reached, if routing got that far.
    pub worker_id: Option<String>,
}

impl AttemptFailure {
    pub fn new(error: InferenceError, worker_id: Option<String>) -> Self {
        Self { error, worker_id }
    }

    /// Failure before any worker was selected.
    pub fn unrouted(error: InferenceError) -> Self {
        Self { error, worker_id: None }
    }
}

/// Drives repeated routing attempts with backoff and worker exclusion.
pub struct RetryExecutor {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::exponential(
                Duration::from_millis(config.initial_delay_ms),
                config.backoff_multiplier,
                Duration::from_millis(config.max_delay_ms),
            ),
            jitter: if config.jitter { Jitter::Full } else { Jitter::None },
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Swap the sleeper; tests use this to skip real delays.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Run `attempt` up to `max_retries + 1` times.
    ///
    /// The closure receives the excluded-worker set accumulated so far. A
    /// non-retryable error, or a retryable one on the final attempt, is
    /// surfaced as-is. `Internal` errors are retried at most once.
    pub async fn execute<T, F, Fut>(
        &self,
        request_id: &str,
        mut attempt: F,
    ) -> Result<T, InferenceError>
    where
        F: FnMut(HashSet<String>, u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let mut excluded: HashSet<String> = HashSet::new();

        for k in 0..=self.max_retries {
            match attempt(excluded.clone(), k).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let retryable = failure.error.is_retryable()
                        // Internal errors get one retry, not a full budget.
                        && !(matches!(failure.error, InferenceError::Internal { .. }) && k >= 1);

                    if !retryable || k == self.max_retries {
                        tracing::debug!(
                            request_id,
                            attempt = k,
                            code = failure.error.code(),
                            "attempt failed; not retrying"
                        );
                        return Err(failure.error);
                    }

                    if let Some(worker_id) = failure.worker_id {
                        excluded.insert(worker_id);
                    }

                    let delay = self.jitter.apply(self.backoff.delay(k));
                    tracing::debug!(
                        request_id,
                        attempt = k,
                        code = failure.error.code(),
                        ?delay,
                        excluded = excluded.len(),
                        "retrying on a different worker"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn unavailable(worker: &str) -> AttemptFailure {
        AttemptFailure::new(
            InferenceError::WorkerUnavailable { worker_id: worker.into(), reason: "down".into() },
            Some(worker.to_string()),
        )
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let executor = RetryExecutor::new(&config(3)).with_sleeper(InstantSleeper);
        let calls = AtomicU32::new(0);
        let result = executor
            .execute("r1", |excluded, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert!(excluded.is_empty());
                    Ok::<_, AttemptFailure>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_worker_is_excluded_on_the_next_attempt() {
        let executor = RetryExecutor::new(&config(2)).with_sleeper(InstantSleeper);
        let result = executor
            .execute("r1", |excluded, attempt| async move {
                match attempt {
                    0 => {
                        assert!(excluded.is_empty());
                        Err(unavailable("w0"))
                    }
                    _ => {
                        assert!(excluded.contains("w0"));
                        assert_eq!(excluded.len(), 1);
                        Ok("w1".to_string())
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "w1");
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let executor = RetryExecutor::new(&config(5)).with_sleeper(InstantSleeper);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute("r1", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AttemptFailure::unrouted(InferenceError::validation("prompt", "empty")))
                }
            })
            .await;
        assert!(matches!(result.unwrap_err(), InferenceError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_workers_surface_no_workers_available() {
        let executor = RetryExecutor::new(&config(5)).with_sleeper(InstantSleeper);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute("r1", |_, attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(unavailable("w0"))
                    } else {
                        // Routing found every healthy worker excluded.
                        Err(AttemptFailure::unrouted(InferenceError::NoWorkersAvailable {
                            model_id: "m".into(),
                        }))
                    }
                }
            })
            .await;
        assert!(matches!(result.unwrap_err(), InferenceError::NoWorkersAvailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "stops as soon as the pool is exhausted");
    }

    #[tokio::test]
    async fn last_attempt_failure_is_surfaced() {
        let executor = RetryExecutor::new(&config(2)).with_sleeper(InstantSleeper);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute("r1", |_, attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(unavailable(&format!("w{attempt}"))) }
            })
            .await;
        assert!(matches!(result.unwrap_err(), InferenceError::WorkerUnavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn backoff_schedule_is_honored() {
        let sleeper = TrackingSleeper::new();
        let executor = RetryExecutor::new(&config(3)).with_sleeper(sleeper.clone());
        let _: Result<(), _> = executor
            .execute("r1", |_, attempt| async move { Err(unavailable(&format!("w{attempt}"))) })
            .await;
        assert_eq!(
            sleeper.requested(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test]
    async fn internal_errors_retry_exactly_once() {
        let executor = RetryExecutor::new(&config(5)).with_sleeper(InstantSleeper);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute("r1", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptFailure::unrouted(InferenceError::internal("boom"))) }
            })
            .await;
        assert!(matches!(result.unwrap_err(), InferenceError::Internal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
