//! Core types used throughout the system
//!
//! Every entity identifier on the wire is an opaque 128-bit value. Aliases
//! keep signatures readable and allow the underlying representation to
//! evolve without touching every module.

use uuid::Uuid;

/// User ID - subject of the gateway bearer token.
pub type UserId = Uuid;

/// Event ID - a sale (one or more shows).
pub type EventId = Uuid;

/// Show ID - a single performance of an event.
pub type ShowId = Uuid;

/// Zone ID - a contiguous, identically-priced section of one show.
///
/// Inventory is counted at zone granularity; the fast-store availability
/// counter is keyed by this id.
pub type ZoneId = Uuid;

/// Booking ID - identifies a reservation across its whole lifecycle.
///
/// Doubles as the bus partition key, so all events of one booking are
/// totally ordered for any single consumer.
pub type BookingId = Uuid;

/// Payment ID - assigned by the payment collaborator.
pub type PaymentId = Uuid;

/// Saga instance ID.
pub type SagaId = Uuid;
