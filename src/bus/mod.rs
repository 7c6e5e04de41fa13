//! Event bus bindings
//!
//! The dispatcher publishes outbox rows through the [`EventBus`] trait.
//! Delivery is at-least-once; consumers must be idempotent. Events sharing
//! a partition key arrive to any single consumer in publish order; there is
//! no ordering across keys.
//!
//! Two backends: the in-process [`ChannelBus`] (default) and, behind the
//! `kafka` feature, [`KafkaBus`].

pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use channel::ChannelBus;
#[cfg(feature = "kafka")]
pub use kafka::KafkaBus;

use async_trait::async_trait;
use thiserror::Error;

/// Topic and event-type vocabulary.
pub mod events {
    // Topics. Partitioned by the key passed to publish.
    pub const BOOKING_TOPIC: &str = "booking-events";
    pub const PAYMENT_TOPIC: &str = "payment-events";
    pub const INVENTORY_TOPIC: &str = "inventory-events";

    // Booking lifecycle, keyed by booking_id.
    pub const BOOKING_RESERVED: &str = "booking.reserved";
    pub const BOOKING_CONFIRMED: &str = "booking.confirmed";
    pub const BOOKING_EXPIRED: &str = "booking.expired";
    pub const BOOKING_CANCELLED: &str = "booking.cancelled";
    pub const BOOKING_NOTIFICATION: &str = "booking.notification";

    // Payment results, keyed by booking_id.
    pub const PAYMENT_SUCCESS: &str = "payment.success";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_SEAT_RELEASE: &str = "payment.seat-release";

    // Inventory projection feed, keyed by zone_id.
    pub const ZONE_INVENTORY_UPDATED: &str = "zone.inventory.updated";
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish timed out")]
    Timeout,
}

/// A published event as seen by in-process subscribers.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

/// Minimal producer-side bus contract.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError>;
}
