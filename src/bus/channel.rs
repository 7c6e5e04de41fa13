//! In-process event bus
//!
//! A tokio broadcast channel standing in for the real broker. Used in
//! standalone mode and by the test suite to observe what the dispatcher
//! actually emitted. Publishing never fails; with no subscriber attached
//! the record is simply dropped, like a broker with no consumer group.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BusError, BusRecord, EventBus};

pub struct ChannelBus {
    tx: broadcast::Sender<BusRecord>,
    published: AtomicU64,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Attach an observer. Late subscribers miss earlier records.
    pub fn subscribe(&self) -> broadcast::Receiver<BusRecord> {
        self.tx.subscribe()
    }

    /// Total records published since startup.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for ChannelBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        let record = BusRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        };
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(record);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = ChannelBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("booking-events", "b1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(record.topic, "booking-events");
        assert_eq!(record.key, "b1");
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_ok() {
        let bus = ChannelBus::new(16);
        bus.publish("t", "k", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(bus.published_count(), 1);
    }
}
