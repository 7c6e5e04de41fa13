//! Fast store - the hot-path allocator
//!
//! During a sale the fast store is the sole allocator of zone inventory.
//! All writers go through one server-side script executing in the store's
//! single-threaded command order, so check + decrement + record happen in
//! one indivisible step and a sold-out zone is rejected in one round trip
//! without touching PostgreSQL.
//!
//! The [`FastStore`] trait is the seam: [`RedisStore`] runs the Lua scripts
//! against Redis, [`MemoryStore`] executes the identical algorithm under a
//! single mutex (tests, standalone mode). Both give the same total order.

pub mod memory;
pub mod redis;
pub mod sync;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use sync::sync_zone_inventory;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::core_types::{BookingId, EventId, ShowId, UserId, ZoneId};
use crate::errors::BookingError;

/// How long the one-shot release marker outlives its booking. Far beyond
/// any plausible reaper/compensation double-release window.
pub(crate) const RELEASE_MARKER_TTL_SECS: u64 = 86_400;

/// Fast-store key layout.
///
/// Keys are shared vocabulary between the Redis scripts, the memory
/// implementation, and operators running `redis-cli`.
pub mod keys {
    use super::*;

    pub fn zone_availability(zone: &ZoneId) -> String {
        format!("zone:availability:{zone}")
    }

    pub fn user_reservations(user: &UserId, event: &EventId) -> String {
        format!("user:reservations:{user}:{event}")
    }

    pub fn reservation(booking: &BookingId) -> String {
        format!("reservation:{booking}")
    }

    pub fn release_marker(booking: &BookingId) -> String {
        format!("reservation:released:{booking}")
    }

    pub fn queue(event: &EventId) -> String {
        format!("queue:{event}")
    }

    pub fn queue_ticket(event: &EventId, user: &UserId) -> String {
        format!("queue:ticket:{event}:{user}")
    }

    pub fn queue_admitted(event: &EventId) -> String {
        format!("queue:admitted:{event}")
    }

    pub fn queue_pass(jti: &str) -> String {
        format!("queue:pass:{jti}")
    }

    pub fn idempotency(key: &str) -> String {
        format!("idem:{key}")
    }
}

/// Arguments for the atomic reserve script (§ one round trip).
#[derive(Debug, Clone)]
pub struct ReserveArgs {
    pub zone: ZoneId,
    pub user: UserId,
    pub booking: BookingId,
    pub event: EventId,
    pub show: ShowId,
    pub quantity: i64,
    pub max_per_user: i64,
    pub unit_price: Decimal,
    pub ttl: Duration,
}

/// Arguments for the inverse (release) script.
///
/// `capacity` caps the availability counter so compensation can never push
/// it above the zone's configured size.
#[derive(Debug, Clone)]
pub struct ReleaseArgs {
    pub zone: ZoneId,
    pub user: UserId,
    pub booking: BookingId,
    pub event: EventId,
    pub quantity: i64,
    pub capacity: i64,
}

/// The `(ok, code, detail)` tuple both scripts return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReply {
    pub ok: bool,
    pub code: String,
    pub detail: i64,
}

impl ScriptReply {
    pub fn ok(detail: i64) -> Self {
        Self {
            ok: true,
            code: "OK".to_string(),
            detail,
        }
    }

    pub fn reject(code: &str, detail: i64) -> Self {
        Self {
            ok: false,
            code: code.to_string(),
            detail,
        }
    }

    /// Convert a rejection into the wire taxonomy; `Ok` carries the detail
    /// (new availability for reserve, restored availability for release).
    pub fn into_result(self) -> Result<i64, BookingError> {
        if self.ok {
            Ok(self.detail)
        } else {
            Err(BookingError::from_script_code(&self.code, self.detail))
        }
    }
}

/// Queue ticket status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Waiting,
    Admitted,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Waiting => "WAITING",
            TicketStatus::Admitted => "ADMITTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(TicketStatus::Waiting),
            "ADMITTED" => Some(TicketStatus::Admitted),
            _ => None,
        }
    }
}

/// Durable queue ticket. The SSE stream is only a view of this record;
/// disconnects never lose a place in line.
#[derive(Debug, Clone)]
pub struct QueueTicket {
    pub user_id: UserId,
    pub status: TicketStatus,
    pub joined_at_ms: i64,
    /// Signed admission pass, present once ADMITTED.
    pub pass: Option<String>,
}

/// Hot-path store operations.
///
/// Everything here is a single store round trip; the two script calls are
/// atomic against all concurrent callers.
#[async_trait]
pub trait FastStore: Send + Sync {
    // === Zone inventory ===

    /// Seed the availability counter. Write-if-absent: a mid-sale restart
    /// must not resurrect stale capacity. Returns true if the key was set.
    async fn init_zone(&self, zone: &ZoneId, available: i64) -> Result<bool, BookingError>;

    async fn zone_available(&self, zone: &ZoneId) -> Result<Option<i64>, BookingError>;

    /// The atomic check + decrement + record step.
    async fn reserve(&self, args: &ReserveArgs) -> Result<ScriptReply, BookingError>;

    /// Inverse of [`reserve`]: restore availability, decrement the user
    /// counter, drop the record. One-shot per booking; the second call
    /// reports `ALREADY_RELEASED` and changes nothing.
    async fn release(&self, args: &ReleaseArgs) -> Result<ScriptReply, BookingError>;

    async fn user_reserved_count(&self, user: &UserId, event: &EventId)
        -> Result<i64, BookingError>;

    /// Whether the TTL-bounded reservation record still exists.
    async fn reservation_record_exists(&self, booking: &BookingId) -> Result<bool, BookingError>;

    // === Virtual queue ===

    /// Append to the event's queue if not present (idempotent) and return
    /// the 1-based position. FIFO by `joined_at_ms`, ties broken by the
    /// lexicographic user id.
    async fn queue_join(
        &self,
        event: &EventId,
        user: &UserId,
        joined_at_ms: i64,
    ) -> Result<u64, BookingError>;

    /// 1-based position, or None if the user is not waiting (never joined,
    /// or already admitted).
    async fn queue_position(&self, event: &EventId, user: &UserId)
        -> Result<Option<u64>, BookingError>;

    /// Remove and return up to `count` users from the head of the queue.
    async fn queue_pop_min(&self, event: &EventId, count: u64) -> Result<Vec<UserId>, BookingError>;

    async fn queue_len(&self, event: &EventId) -> Result<u64, BookingError>;

    async fn ticket_save(&self, event: &EventId, ticket: &QueueTicket) -> Result<(), BookingError>;

    async fn ticket_get(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<Option<QueueTicket>, BookingError>;

    async fn admitted_count(&self, event: &EventId) -> Result<u64, BookingError>;

    async fn incr_admitted(&self, event: &EventId, by: u64) -> Result<u64, BookingError>;

    /// Tear down all queue state for an event when its sale window closes.
    async fn clear_queue(&self, event: &EventId) -> Result<(), BookingError>;

    // === One-shot markers ===

    /// Record a pass redemption. Returns true the first time, false on any
    /// replay within `ttl`.
    async fn redeem_pass(&self, jti: &str, ttl: Duration) -> Result<bool, BookingError>;

    // === Idempotency window ===

    async fn idem_get(&self, key: &str) -> Result<Option<String>, BookingError>;

    /// Store the first response for `key`. Returns false if a value was
    /// already present (lost a concurrent race; caller re-reads).
    async fn idem_put(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, BookingError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_layout() {
        let zone = Uuid::nil();
        assert_eq!(
            keys::zone_availability(&zone),
            "zone:availability:00000000-0000-0000-0000-000000000000"
        );
        assert!(keys::queue_pass("abc").ends_with(":abc"));
        assert!(keys::idempotency("k1").starts_with("idem:"));
    }

    #[test]
    fn test_reply_into_result() {
        assert_eq!(ScriptReply::ok(7).into_result().unwrap(), 7);
        let err = ScriptReply::reject("INSUFFICIENT_STOCK", 3)
            .into_result()
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
    }

    #[test]
    fn test_ticket_status_roundtrip() {
        assert_eq!(
            TicketStatus::from_str(TicketStatus::Waiting.as_str()),
            Some(TicketStatus::Waiting)
        );
        assert_eq!(TicketStatus::from_str("GONE"), None);
    }
}
