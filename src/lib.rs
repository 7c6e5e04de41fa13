//! Rushtix - Flash-Sale Ticket Booking Platform
//!
//! Absorbs flash-sale traffic against a single hot event without ever
//! overselling a zone: the fast store's atomic script is the sole
//! allocator, PostgreSQL is the durable record, and the outbox bridges the
//! two to the event bus.
//!
//! # Modules
//!
//! - [`core_types`] - Opaque 128-bit identifiers
//! - [`config`] - Env-driven configuration
//! - [`errors`] - Stable wire error taxonomy
//! - [`models`] - Reservation domain model
//! - [`store`] - Fast store: atomic scripts, queue state, idempotency window
//! - [`catalog`] - Catalog collaborator (read-side snapshots)
//! - [`bus`] - Event bus bindings (channel, kafka)
//! - [`outbox`] - Transactional outbox + dispatcher
//! - [`reservation`] - Reservation engine + expiry reaper
//! - [`queue`] - Virtual queue admission control
//! - [`saga`] - Booking saga orchestrator
//! - [`payment`] - Payment collaborator
//! - [`idempotency`] - Response replay layer
//! - [`gateway`] - HTTP ingress (auth, rate limiting, routing)

// Core types - must be first!
pub mod core_types;

// Configuration & plumbing
pub mod config;
pub mod errors;
pub mod logging;

// Domain
pub mod models;

// Infrastructure
pub mod bus;
pub mod catalog;
pub mod payment;
pub mod store;

// Booking core
pub mod idempotency;
pub mod outbox;
pub mod queue;
pub mod reservation;
pub mod saga;

// Ingress
pub mod gateway;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{BookingId, EventId, PaymentId, SagaId, ShowId, UserId, ZoneId};
pub use errors::BookingError;
pub use models::{Reservation, ReservationStatus};
pub use reservation::{ExpiryReaper, ReservationEngine, ReserveSpec};
pub use saga::{SagaOrchestrator, SagaState};
pub use store::{FastStore, MemoryStore, RedisStore};
