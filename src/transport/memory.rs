//! In-process transport. Every subscriber of a topic gets every message
//! published to it after it subscribed.

use super::{GuardianMessage, Transport, TransportError};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryTransport {
    topics: Arc<DashMap<String, Vec<mpsc::UnboundedSender<GuardianMessage>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, message: &GuardianMessage) -> Result<(), TransportError> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
            debug!(topic, subscribers = subscribers.len(), %message, "published");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<GuardianMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
