//! Cross-component notifications.
//!
//! Components publish [`ControlEvent`]s onto a bounded broadcast channel.
//! Slow subscribers lose the oldest events rather than blocking a publisher;
//! a lagged receiver observes how many it missed and the drop is logged.

use crate::breaker::BreakerState;
use tokio::sync::broadcast;

/// Which regression metric an alert concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionMetric {
    Throughput,
    TimeToFirstToken,
    ErrorRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Everything the control plane announces out-of-band.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    WorkerOffline { worker_id: String, last_heartbeat_ms: u64 },
    BreakerTransition { worker_id: String, from: BreakerState, to: BreakerState },
    BackpressureApplied { stream_id: String, unacked: usize },
    BackpressureReleased { stream_id: String },
    SlowConsumer { stream_id: String, ack_latency_ms: u64 },
    ChunkTimeout { stream_id: String, chunk_id: String },
    RequestDropped { request_id: String, reason: String },
    Alert { metric: RegressionMetric, severity: AlertSeverity, observed: f64, baseline: f64 },
    RollbackRequested { metric: RegressionMetric },
}

/// Handle for publishing and subscribing to control events.
#[derive(Debug, Clone)]
pub struct ControlEvents {
    sender: broadcast::Sender<ControlEvent>,
}

impl ControlEvents {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// discarded silently.
    pub fn emit(&self, event: ControlEvent) {
        tracing::debug!(?event, "control event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ControlEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let events = ControlEvents::new(16);
        let mut rx = events.subscribe();
        events.emit(ControlEvent::WorkerOffline { worker_id: "w1".into(), last_heartbeat_ms: 9 });
        events.emit(ControlEvent::BackpressureReleased { stream_id: "s1".into() });

        match rx.recv().await.unwrap() {
            ControlEvent::WorkerOffline { worker_id, .. } => assert_eq!(worker_id, "w1"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ControlEvent::BackpressureReleased { stream_id } => assert_eq!(stream_id, "s1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let events = ControlEvents::new(4);
        events.emit(ControlEvent::BackpressureReleased { stream_id: "s".into() });
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_loses_oldest() {
        let events = ControlEvents::new(2);
        let mut rx = events.subscribe();
        for i in 0..5 {
            events.emit(ControlEvent::RequestDropped {
                request_id: format!("r{i}"),
                reason: "test".into(),
            });
        }
        // The first recv reports the lag instead of silently skipping.
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        match rx.recv().await.unwrap() {
            ControlEvent::RequestDropped { request_id, .. } => assert_eq!(request_id, "r3"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
