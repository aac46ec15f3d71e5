//! Message bus abstraction.
//!
//! The control plane talks to workers through a publish/subscribe channel.
//! Real deployments plug in a broker; tests and single-process wiring use
//! [`InMemoryBus`]. Payloads are the JSON documents defined in
//! [`crate::protocol`].

use crate::error::InferenceError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscription buffer. Response streams are paced by the consumer, so
/// a modest buffer suffices; a full buffer applies backpressure to publish.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Transport seam between controller and workers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic. Fails when nothing is listening, which
    /// routing treats the same as a refused connection.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), InferenceError>;

    /// Subscribe to a topic; messages published afterwards arrive in order.
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, InferenceError>;
}

/// Receiving half of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct BusSubscription {
    receiver: mpsc::Receiver<Value>,
}

impl BusSubscription {
    pub fn new(receiver: mpsc::Receiver<Value>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once every publisher side is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

/// In-process bus with per-topic fan-out and per-topic FIFO ordering.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBus {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), InferenceError> {
        let senders: Vec<mpsc::Sender<Value>> = {
            let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            match topics.get_mut(topic) {
                Some(senders) => {
                    senders.retain(|s| !s.is_closed());
                    if senders.is_empty() {
                        topics.remove(topic);
                        Vec::new()
                    } else {
                        senders.clone()
                    }
                }
                None => Vec::new(),
            }
        };

        if senders.is_empty() {
            return Err(InferenceError::WorkerUnavailable {
                worker_id: topic.to_string(),
                reason: "no subscribers on topic".into(),
            });
        }

        let mut delivered = 0usize;
        for sender in senders {
            if sender.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(InferenceError::WorkerUnavailable {
                worker_id: topic.to_string(),
                reason: "all subscribers gone".into(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, InferenceError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(BusSubscription::new(receiver))
    }
}
