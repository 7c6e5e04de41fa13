//! Reservation lifecycle
//!
//! # Architecture
//!
//! The engine wraps the fast store's atomic script: the script is the sole
//! allocator, PostgreSQL is the durable record. A reserve is one script
//! round trip plus one relational transaction (reservation row + outbox
//! row); every rejection returns before any relational work happens.
//!
//! ```text
//! reserve  → script(check+decr+record) → INSERT reservation + outbox ─► 201
//!                     │                          │
//!                  reject ─► 409 (no DB)      tx fails ─► compensate script
//!
//! confirm  → CAS RESERVED→CONFIRMED + outbox (inventory stays spent)
//! release  → CAS RESERVED→CANCELLED + outbox → script inverse
//! expiry   → reaper: CAS RESERVED→EXPIRED + outbox → script inverse
//! ```
//!
//! Exactly one of (confirm, expire, release) wins the CAS; the losers see a
//! terminal status and must not touch inventory.

pub mod engine;
pub mod reaper;
pub mod repository;

pub use engine::{ReservationEngine, ReserveSpec};
pub use reaper::ExpiryReaper;
pub use repository::ReservationDb;
