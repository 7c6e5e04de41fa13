//! Kafka event bus backend
//!
//! Producer configured for exactly the guarantees the outbox needs:
//! idempotent producer, acks=all, bounded in-flight. The outbox dispatcher
//! supplies the retry machinery; a failed send here just surfaces as a
//! retryable [`BusError`].

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::config::timeouts;

use super::{BusError, EventBus};

pub struct KafkaBus {
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", "rushtix-outbox")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "3")
            .create()
            .map_err(|e| BusError::Publish(format!("producer init: {e}")))?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        let body = payload.to_string();
        let record = FutureRecord::to(topic).key(key).payload(&body);

        let send = self.producer.send(record, timeouts::PUBLISH);
        match tokio::time::timeout(timeouts::PUBLISH + Duration::from_secs(1), send).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(BusError::Publish(e.to_string())),
            Err(_) => Err(BusError::Timeout),
        }
    }
}
