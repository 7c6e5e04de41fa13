//! Reservation domain model
//!
//! A reservation is a time-bounded hold on `quantity` seats in one zone.
//! Status ids are SMALLINTs in PostgreSQL; terminal states are negative
//! except CONFIRMED, mirroring the sign convention used for saga states.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core_types::{BookingId, EventId, ShowId, UserId, ZoneId};

/// Reservation lifecycle states.
///
/// Transitions are monotone:
/// RESERVED → CONFIRMED | CANCELLED | EXPIRED; the three on the right are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum ReservationStatus {
    /// Seats held, payment pending, TTL running
    Reserved = 10,

    /// Terminal: payment succeeded, confirmation code assigned
    Confirmed = 20,

    /// Terminal: released by the user or by saga compensation
    Cancelled = -10,

    /// Terminal: TTL elapsed without confirmation
    Expired = -20,
}

impl ReservationStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }

    /// Numeric id for PostgreSQL storage.
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            10 => Some(ReservationStatus::Reserved),
            20 => Some(ReservationStatus::Confirmed),
            -10 => Some(ReservationStatus::Cancelled),
            -20 => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reservation row, including the denormalized catalog snapshot taken at
/// reservation time (names survive later catalog edits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: BookingId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub show_id: ShowId,
    pub zone_id: ZoneId,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmation_code: Option<String>,
    pub idempotency_key: String,
    // Snapshot at reservation time
    pub event_name: String,
    pub show_name: String,
    pub zone_name: String,
    pub venue: String,
    /// Zone capacity at reservation time; caps compensation so a release
    /// can never push availability above the configured size.
    pub zone_capacity: i64,
}

impl Reservation {
    /// Whether the hold is still claimable (RESERVED and not past TTL).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ReservationStatus::Reserved.is_terminal());
        assert!(ReservationStatus::Confirmed.is_terminal());
        assert!(ReservationStatus::Cancelled.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            ReservationStatus::Reserved,
            ReservationStatus::Confirmed,
            ReservationStatus::Cancelled,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(ReservationStatus::from_id(99), None);
    }

    #[test]
    fn test_is_active_respects_ttl() {
        let now = Utc::now();
        let res = Reservation {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            event_id: uuid::Uuid::new_v4(),
            show_id: uuid::Uuid::new_v4(),
            zone_id: uuid::Uuid::new_v4(),
            quantity: 2,
            unit_price: Decimal::new(5000, 2),
            total: Decimal::new(10000, 2),
            status: ReservationStatus::Reserved,
            reserved_at: now,
            expires_at: now + chrono::Duration::seconds(600),
            confirmation_code: None,
            idempotency_key: "k".into(),
            event_name: "e".into(),
            show_name: "s".into(),
            zone_name: "z".into(),
            venue: "v".into(),
            zone_capacity: 100,
        };
        assert!(res.is_active(now));
        assert!(!res.is_active(now + chrono::Duration::seconds(601)));
    }
}
