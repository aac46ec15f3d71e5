//! Attempt deadlines.
//!
//! Every worker-dispatch step runs under a deadline. Expiry drops the inner
//! future (tokio cancellation propagates through any publish, subscribe, or
//! await the attempt was blocked on) and yields a tagged
//! [`InferenceError::Timeout`].

use crate::config::TimeoutConfig;
use crate::error::InferenceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Applies the standard or streaming deadline to dispatch attempts.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineEnforcer {
    standard: Duration,
    streaming: Duration,
}

impl DeadlineEnforcer {
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            standard: Duration::from_millis(config.standard_timeout_ms),
            streaming: Duration::from_millis(config.streaming_timeout_ms),
        }
    }

    /// Deadline applicable to a request. Streaming requests always use the
    /// streaming budget, including for the first-token wait.
    pub fn budget(&self, streaming: bool) -> Duration {
        if streaming {
            self.streaming
        } else {
            self.standard
        }
    }

    /// Run `operation` under the chosen deadline.
    ///
    /// On expiry the operation is cancelled (dropped) and the error carries
    /// the method name, the limit, the request id, and the observed elapsed
    /// time. Cancellation is cooperative: the dropped future must release
    /// any worker slot it held, which tokio drop semantics guarantee for
    /// the channel operations used on the dispatch path.
    pub async fn enforce<T, Fut>(
        &self,
        method: &'static str,
        request_id: &str,
        streaming: bool,
        operation: Fut,
    ) -> Result<T, InferenceError>
    where
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let limit = self.budget(streaming);
        let start = Instant::now();
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::warn!(request_id, method, ?limit, ?elapsed, "attempt deadline expired");
                Err(InferenceError::Timeout {
                    method,
                    limit,
                    elapsed,
                    request_id: request_id.to_string(),
                })
            }
        }
    }
}
