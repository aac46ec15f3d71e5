//! Error taxonomy for the control plane.
//!
//! Every failure a caller can observe is one of these variants; raw transport
//! or serialization errors never cross the public surface. Each variant maps
//! to a stable wire code (see [`InferenceError::code`]) so frontends can
//! branch without matching on Rust types.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for routing, scheduling, streaming, and dispatch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// A request field violated its allowed range. Never retried.
    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Routing exhausted: every worker serving the model is excluded or gone.
    #[error("no workers available for model `{model_id}`")]
    NoWorkersAvailable { model_id: String },

    /// The healthy-worker snapshot was empty before eligibility filtering.
    #[error("no healthy workers ({online} online of {known} known)")]
    NoHealthyWorkers { online: usize, known: usize },

    /// An attempt deadline expired. Retryable against another worker.
    #[error("{method} timed out after {elapsed:?} (limit {limit:?}) [request {request_id}]")]
    Timeout { method: &'static str, limit: Duration, elapsed: Duration, request_id: String },

    /// Publish or connection failure talking to a worker. Retryable.
    #[error("worker `{worker_id}` unavailable: {reason}")]
    WorkerUnavailable { worker_id: String, reason: String },

    /// The selected worker's breaker refused the call. Retryable elsewhere.
    #[error("circuit breaker open for worker `{worker_id}` ({failure_count} failures)")]
    CircuitBreakerOpen { worker_id: String, failure_count: u32 },

    /// Explicit cancellation or stream closure. Never retried.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// Admission refused because the queue is at capacity.
    #[error("queue full ({depth} of {max})")]
    QueueFull { depth: usize, max: usize },

    /// Unexpected internal failure. Retried once, then surfaced.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl InferenceError {
    /// Stable wire code for this error, distinct from the Rust type.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::NoWorkersAvailable { .. } => "NO_WORKERS_AVAILABLE",
            Self::NoHealthyWorkers { .. } => "NO_HEALTHY_WORKERS",
            Self::Timeout { .. } => "WORKER_TIMEOUT",
            Self::WorkerUnavailable { .. } => "WORKER_UNAVAILABLE",
            Self::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            Self::Cancelled { .. } => "CANCELLED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether a routing attempt that failed with this error may be retried
    /// on a different worker. `Internal` is retryable exactly once; the
    /// retry executor enforces the "once" part.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::WorkerUnavailable { .. }
                | Self::CircuitBreakerOpen { .. }
                | Self::Internal { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitBreakerOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Convenience constructor for validation failures.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { field, reason: reason.into() }
    }

    /// Convenience constructor for cancellations.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled { reason: reason.into() }
    }

    /// Convenience constructor for internal errors.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let errors = [
            InferenceError::validation("temperature", "out of range"),
            InferenceError::NoWorkersAvailable { model_id: "m".into() },
            InferenceError::NoHealthyWorkers { online: 0, known: 3 },
            InferenceError::Timeout {
                method: "dispatch",
                limit: Duration::from_secs(1),
                elapsed: Duration::from_secs(2),
                request_id: "r1".into(),
            },
            InferenceError::WorkerUnavailable { worker_id: "w1".into(), reason: "gone".into() },
            InferenceError::CircuitBreakerOpen { worker_id: "w1".into(), failure_count: 5 },
            InferenceError::cancelled("client hung up"),
            InferenceError::QueueFull { depth: 10, max: 10 },
            InferenceError::internal("oops"),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len(), "every variant carries a unique code");
    }

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(InferenceError::Timeout {
            method: "dispatch",
            limit: Duration::from_secs(1),
            elapsed: Duration::from_secs(1),
            request_id: "r".into(),
        }
        .is_retryable());
        assert!(InferenceError::WorkerUnavailable { worker_id: "w".into(), reason: "x".into() }
            .is_retryable());
        assert!(InferenceError::CircuitBreakerOpen { worker_id: "w".into(), failure_count: 1 }
            .is_retryable());
        assert!(InferenceError::internal("x").is_retryable());

        assert!(!InferenceError::validation("prompt", "empty").is_retryable());
        assert!(!InferenceError::NoWorkersAvailable { model_id: "m".into() }.is_retryable());
        assert!(!InferenceError::NoHealthyWorkers { online: 0, known: 0 }.is_retryable());
        assert!(!InferenceError::cancelled("x").is_retryable());
        assert!(!InferenceError::QueueFull { depth: 1, max: 1 }.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = InferenceError::Timeout {
            method: "dispatch",
            limit: Duration::from_millis(500),
            elapsed: Duration::from_millis(612),
            request_id: "req-7".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("dispatch"));
        assert!(msg.contains("req-7"));
    }
}
