use async_trait::async_trait;
use bytes::Bytes;
use duplex::ports::{BusMessage, BusStream, EventBus, pattern_matches};
use futures::StreamExt;
use shared::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// In-process bus for single-host deployments and tests.
///
/// Every subscriber sees every message whose topic matches its pattern,
/// including its own publishes, in publish order.
pub struct MemoryEventBus {
    sender: broadcast::Sender<BusMessage>,
    published: AtomicU64,
}

impl MemoryEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Messages published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error
        let receivers = self
            .sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0);
        tracing::trace!(topic = %topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream> {
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |message| {
            let delivered = match message {
                Ok(message) if pattern_matches(&pattern, &message.topic) => Some(message),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(pattern = %pattern, skipped, "Subscriber lagged, messages lost");
                    None
                }
            };
            futures::future::ready(delivered)
        });
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("published", &self.published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_subscription() {
        let bus = MemoryEventBus::default();
        let mut expired = bus.subscribe("__keyevent@*__:expired").await.unwrap();
        let mut all = bus.subscribe("*").await.unwrap();

        bus.publish("duplex:cache:users", Bytes::from_static(b"event"))
            .await
            .unwrap();
        bus.publish("__keyevent@0__:expired", Bytes::from_static(b"users::k"))
            .await
            .unwrap();

        let message = expired.next().await.unwrap();
        assert_eq!(message.topic, "__keyevent@0__:expired");
        assert_eq!(message.payload, Bytes::from_static(b"users::k"));

        assert_eq!(all.next().await.unwrap().topic, "duplex:cache:users");
        assert_eq!(all.next().await.unwrap().topic, "__keyevent@0__:expired");
        assert_eq!(bus.published(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryEventBus::new(4);
        bus.publish("nobody", Bytes::new()).await.unwrap();
        assert_eq!(bus.published(), 1);
    }
}
