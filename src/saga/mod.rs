//! Booking saga
//!
//! Coordinates Reserve → Pay → Confirm → Notify with per-step compensation
//! across the fast store, PostgreSQL, the payment collaborator, and the
//! outbox.
//!
//! # State machine
//!
//! ```text
//! CREATED ──► RESERVED ──► PAID ──► CONFIRMED   (happy path)
//!     │           │          │
//!     │           │          └──► FAILED        (confirm fails → refund + release)
//!     │           └─────────────► FAILED        (payment fails → release)
//!     └─► CANCELLED                             (user cancel before reserve)
//! ```
//!
//! # Safety invariants
//!
//! 1. **Persist-before-step**: the saga row exists before step 1 runs, and
//!    every transition is a CAS on the expected from-state.
//! 2. **Monotone transitions**: terminal states never move again.
//! 3. **Compensation never blocks terminality**: a failed compensation is
//!    logged for the operator queue; the saga still reaches FAILED.
//! 4. **Notification is non-critical**: its failure is recorded, never
//!    compensated.

pub mod db;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod step;
pub mod steps;

pub use db::{SagaDb, SagaInstance};
pub use orchestrator::{SagaConfig, SagaOrchestrator};
pub use recovery::{RecoveryConfig, SagaRecoveryWorker};
pub use state::SagaState;
pub use step::{SagaContext, SagaStep, StepError, StepOutput};
