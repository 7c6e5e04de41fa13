//! Gateway application state (shared)

use std::sync::Arc;

use sqlx::PgPool;

use crate::idempotency::IdempotencyLayer;
use crate::queue::QueueService;
use crate::reservation::ReservationEngine;
use crate::saga::SagaOrchestrator;
use crate::store::FastStore;

use super::auth::AuthVerifier;
use super::rate_limit::RateLimiter;

pub struct AppState {
    /// Booking pipeline (reserve, confirm, release, recovery)
    pub orchestrator: Arc<SagaOrchestrator>,
    /// Direct reservation reads
    pub engine: Arc<ReservationEngine>,
    /// Virtual queue controllers
    pub queue: Arc<QueueService>,
    /// Response replay window for mutating endpoints
    pub idempotency: Arc<IdempotencyLayer>,
    /// Bearer token verification
    pub auth: Arc<AuthVerifier>,
    /// Per-IP token buckets
    pub limiter: Arc<RateLimiter>,
    /// Health checks
    pub pool: PgPool,
    pub store: Arc<dyn FastStore>,
}
