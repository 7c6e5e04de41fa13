//! Transactional outbox
//!
//! Every business state change that must be announced writes an outbox row
//! inside the same PostgreSQL transaction as the change itself, so state
//! and event emission are atomic. The dispatcher drains PENDING rows to the
//! bus at-least-once; consumers must be idempotent.

pub mod dispatcher;

pub use dispatcher::OutboxDispatcher;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::bus::events;
use crate::core_types::{BookingId, ZoneId};
use crate::errors::BookingError;
use crate::models::Reservation;

/// Outbox row dispatch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OutboxStatus {
    Pending = 0,
    Published = 1,
    /// Retry budget exhausted; operator attention required.
    Failed = -1,
}

impl OutboxStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OutboxStatus::Pending),
            1 => Some(OutboxStatus::Published),
            -1 => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A row to be written inside a business transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    /// Events sharing this key arrive to any single consumer in publish
    /// order.
    pub partition_key: String,
}

impl NewOutboxEvent {
    fn booking(event_type: &str, reservation: &Reservation) -> Self {
        Self {
            aggregate_type: "booking".into(),
            aggregate_id: reservation.id.to_string(),
            event_type: event_type.into(),
            payload: json!({
                "booking_id": reservation.id,
                "user_id": reservation.user_id,
                "event_id": reservation.event_id,
                "show_id": reservation.show_id,
                "zone_id": reservation.zone_id,
                "quantity": reservation.quantity,
                "unit_price": reservation.unit_price,
                "total": reservation.total,
                "status": reservation.status.as_str(),
                "reserved_at": reservation.reserved_at,
                "expires_at": reservation.expires_at,
                "confirmation_code": reservation.confirmation_code,
                "event_name": reservation.event_name,
                "show_name": reservation.show_name,
                "zone_name": reservation.zone_name,
                "venue": reservation.venue,
            }),
            topic: events::BOOKING_TOPIC.into(),
            partition_key: reservation.id.to_string(),
        }
    }

    pub fn booking_reserved(reservation: &Reservation) -> Self {
        Self::booking(events::BOOKING_RESERVED, reservation)
    }

    pub fn booking_confirmed(reservation: &Reservation) -> Self {
        Self::booking(events::BOOKING_CONFIRMED, reservation)
    }

    pub fn booking_expired(reservation: &Reservation) -> Self {
        Self::booking(events::BOOKING_EXPIRED, reservation)
    }

    pub fn booking_cancelled(reservation: &Reservation) -> Self {
        Self::booking(events::BOOKING_CANCELLED, reservation)
    }

    pub fn booking_notification(reservation: &Reservation) -> Self {
        Self::booking(events::BOOKING_NOTIFICATION, reservation)
    }

    pub fn payment_event(
        event_type: &str,
        booking: &BookingId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: "payment".into(),
            aggregate_id: booking.to_string(),
            event_type: event_type.into(),
            payload,
            topic: events::PAYMENT_TOPIC.into(),
            partition_key: booking.to_string(),
        }
    }

    pub fn zone_inventory_updated(zone: &ZoneId, available: i64) -> Self {
        Self {
            aggregate_type: "zone".into(),
            aggregate_id: zone.to_string(),
            event_type: events::ZONE_INVENTORY_UPDATED.into(),
            payload: json!({ "zone_id": zone, "available": available }),
            topic: events::INVENTORY_TOPIC.into(),
            partition_key: zone.to_string(),
        }
    }
}

/// A claimed row in flight through the dispatcher.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub partition_key: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

/// Insert an outbox row inside the caller's transaction.
pub async fn insert_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
    max_retries: i32,
) -> Result<Uuid, BookingError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO outbox_events
            (id, aggregate_type, aggregate_id, event_type, payload, topic,
             partition_key, status, retry_count, max_retries, created_at, next_attempt_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, NOW(), NOW())
        "#,
    )
    .bind(id)
    .bind(&event.aggregate_type)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(&event.topic)
    .bind(&event.partition_key)
    .bind(OutboxStatus::Pending.id())
    .bind(max_retries)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

/// Insert an outbox row in its own transaction. For events whose business
/// change lives in the fast store (inventory counters) rather than in a
/// relational row.
pub async fn insert_standalone(
    pool: &sqlx::PgPool,
    event: &NewOutboxEvent,
    max_retries: i32,
) -> Result<Uuid, BookingError> {
    let mut tx = pool.begin().await?;
    let id = insert_in_tx(&mut tx, event, max_retries).await?;
    tx.commit().await?;
    Ok(id)
}

/// Claim up to `batch` due PENDING rows, oldest first. Row-level locks with
/// SKIP LOCKED keep concurrent dispatcher instances off each other's rows;
/// the locks are held until the caller's transaction ends.
pub async fn claim_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch: i64,
) -> Result<Vec<OutboxEvent>, BookingError> {
    let rows = sqlx::query(
        r#"
        SELECT id, event_type, payload, topic, partition_key,
               retry_count, max_retries, created_at
        FROM outbox_events
        WHERE status = $1
          AND next_attempt_at <= NOW()
        ORDER BY created_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(OutboxStatus::Pending.id())
    .bind(batch)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| OutboxEvent {
            id: row.get("id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            topic: row.get("topic"),
            partition_key: row.get("partition_key"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            created_at: row.get("created_at"),
        })
        .collect())
}

pub async fn mark_published(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<(), BookingError> {
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = $1, published_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(OutboxStatus::Published.id())
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record a publish failure: bump the retry counter and either schedule the
/// next attempt or move the row to FAILED once the budget is spent.
pub async fn mark_failed_attempt(
    tx: &mut Transaction<'_, Postgres>,
    event: &OutboxEvent,
    error: &str,
    backoff_secs: i64,
) -> Result<OutboxStatus, BookingError> {
    let attempts = event.retry_count + 1;
    let status = if attempts >= event.max_retries {
        OutboxStatus::Failed
    } else {
        OutboxStatus::Pending
    };

    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = $1,
            retry_count = $2,
            last_error = $3,
            next_attempt_at = NOW() + make_interval(secs => $4)
        WHERE id = $5
        "#,
    )
    .bind(status.id())
    .bind(attempts)
    .bind(error)
    .bind(backoff_secs as f64)
    .bind(event.id)
    .execute(&mut **tx)
    .await?;

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn reservation() -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            show_id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            quantity: 2,
            unit_price: Decimal::new(5000, 2),
            total: Decimal::new(10000, 2),
            status: crate::models::ReservationStatus::Reserved,
            reserved_at: now,
            expires_at: now + chrono::Duration::seconds(600),
            confirmation_code: None,
            idempotency_key: "k".into(),
            event_name: "e".into(),
            show_name: "s".into(),
            zone_name: "z".into(),
            venue: "v".into(),
            zone_capacity: 100,
        }
    }

    #[test]
    fn test_booking_events_share_partition_key() {
        let res = reservation();
        let reserved = NewOutboxEvent::booking_reserved(&res);
        let confirmed = NewOutboxEvent::booking_confirmed(&res);
        assert_eq!(reserved.partition_key, confirmed.partition_key);
        assert_eq!(reserved.topic, "booking-events");
        assert_eq!(reserved.event_type, "booking.reserved");
    }

    #[test]
    fn test_inventory_event_keyed_by_zone() {
        let zone = Uuid::new_v4();
        let event = NewOutboxEvent::zone_inventory_updated(&zone, 42);
        assert_eq!(event.partition_key, zone.to_string());
        assert_eq!(event.payload["available"], 42);
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::from_id(status.id()), Some(status));
        }
    }
}
