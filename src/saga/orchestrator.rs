//! Saga orchestrator
//!
//! Drives the booking pipeline with per-step timeout and retry budget,
//! compensating completed steps in reverse order on definitive failure.
//! State is persisted before step 1 and CAS-updated after every
//! transition; steps themselves stay stateless.
//!
//! The reserve step runs synchronously on the hot path. The payment →
//! confirm → notify tail runs in a spawned task, so a client disconnect
//! mid-pipeline cannot abandon a charged-but-unconfirmed booking: the
//! pipeline always reaches a terminal state, with compensation if needed.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::core_types::{BookingId, SagaId, UserId};
use crate::errors::BookingError;
use crate::models::{Reservation, ReservationStatus};
use crate::payment::PaymentGateway;
use crate::reservation::{ReservationEngine, ReserveSpec};

use super::db::{SagaDb, SagaInstance};
use super::state::SagaState;
use super::step::{SagaContext, SagaStep, StepError, StepOutput};
use super::steps::{ConfirmBooking, ProcessPayment, ReserveSeats, SendNotification};

#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub step_timeout: Duration,
    pub retries: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

pub struct SagaOrchestrator {
    db: Arc<SagaDb>,
    engine: Arc<ReservationEngine>,
    reserve: Arc<dyn SagaStep>,
    pay: Arc<dyn SagaStep>,
    confirm: Arc<dyn SagaStep>,
    notify: Arc<dyn SagaStep>,
    config: SagaConfig,
}

impl SagaOrchestrator {
    pub fn new(
        db: Arc<SagaDb>,
        engine: Arc<ReservationEngine>,
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        outbox_max_retries: i32,
        config: SagaConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            reserve: Arc::new(ReserveSeats::new(
                engine.clone(),
                pool.clone(),
                outbox_max_retries,
            )),
            pay: Arc::new(ProcessPayment::new(
                gateway,
                pool.clone(),
                outbox_max_retries,
            )),
            confirm: Arc::new(ConfirmBooking::new(engine.clone())),
            notify: Arc::new(SendNotification::new(
                engine.clone(),
                pool,
                outbox_max_retries,
            )),
            db,
            engine,
            config,
        })
    }

    pub fn db(&self) -> &Arc<SagaDb> {
        &self.db
    }

    /// Execute one step under its timeout, retrying transient failures
    /// within the budget.
    async fn run_step(
        &self,
        step: &Arc<dyn SagaStep>,
        ctx: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(self.config.step_timeout, step.execute(ctx)).await;
            let err = match outcome {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => e,
                Err(_) => StepError::Transient(format!("step {} timed out", step.name())),
            };

            if err.is_transient() && attempt < self.config.retries {
                attempt += 1;
                if let Err(db_err) = self.db.increment_retry(ctx.saga_id).await {
                    warn!(saga_id = %ctx.saga_id, error = %db_err, "Retry count update failed");
                }
                warn!(
                    saga_id = %ctx.saga_id,
                    step = step.name(),
                    attempt,
                    error = %err,
                    "Transient step failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                continue;
            }
            return Err(err);
        }
    }

    /// Persist a completed step: outputs first, then the CAS transition.
    async fn complete_step(
        &self,
        ctx: &SagaContext,
        step: &Arc<dyn SagaStep>,
        from: SagaState,
        output: &StepOutput,
    ) -> Result<(), BookingError> {
        ctx.record(output);
        self.db.record_output(ctx.saga_id, output).await?;
        let moved = self
            .db
            .transition(ctx.saga_id, from, step.completed_state(), step.name())
            .await?;
        if !moved {
            // Another worker raced us; the persisted state wins.
            warn!(
                saga_id = %ctx.saga_id,
                step = step.name(),
                "Saga transition lost a race"
            );
        }
        Ok(())
    }

    /// Compensate completed steps in reverse order. Failures are logged and
    /// escalated but never block the saga from terminating.
    async fn compensate_all(&self, ctx: &SagaContext, completed: &[&Arc<dyn SagaStep>]) {
        for step in completed.iter().rev() {
            match step.compensate(ctx).await {
                Ok(()) => info!(
                    saga_id = %ctx.saga_id,
                    step = step.name(),
                    "Compensation complete"
                ),
                Err(e) => error!(
                    saga_id = %ctx.saga_id,
                    step = step.name(),
                    error = %e,
                    "Compensation failed; operator reconciliation required"
                ),
            }
        }
    }

    async fn fail_saga(&self, ctx: &SagaContext, from: SagaState, reason: &str) {
        if let Err(e) = self.db.set_error(ctx.saga_id, reason).await {
            warn!(saga_id = %ctx.saga_id, error = %e, "Saga error write failed");
        }
        match self.db.transition(ctx.saga_id, from, SagaState::Failed, reason).await {
            Ok(true) => {}
            Ok(false) => warn!(saga_id = %ctx.saga_id, "FAILED transition lost a race"),
            Err(e) => error!(saga_id = %ctx.saga_id, error = %e, "FAILED transition write failed"),
        }
    }

    // ========================================================
    // Entry points
    // ========================================================

    /// The hot path: create the saga and run ReserveSeats synchronously.
    pub async fn start_booking(
        &self,
        user: UserId,
        spec: ReserveSpec,
        idempotency_key: &str,
        queue_pass: Option<String>,
    ) -> Result<Reservation, BookingError> {
        // Replay: the reservation (and its saga) already exist.
        if let Some(existing) = self
            .engine
            .db()
            .get_by_idempotency_key(idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        let saga_id = SagaId::new_v4();
        self.db.insert(saga_id, user, spec.event_id).await?;
        let ctx = SagaContext::new(saga_id, user, spec, idempotency_key.to_string(), queue_pass);

        match self.run_step(&self.reserve, &ctx).await {
            Ok(output) => {
                self.complete_step(&ctx, &self.reserve, SagaState::Created, &output)
                    .await?;
                ctx.reservation()
                    .ok_or_else(|| BookingError::Internal("reserve step lost its output".into()))
            }
            Err(step_err) => {
                let err = step_err.into_booking_error();
                self.fail_saga(&ctx, SagaState::Created, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Resume the saga at payment: Pay → Confirm → Notify.
    ///
    /// Spawned so transport-level cancellation cannot strand a booking
    /// between a committed charge and its confirmation.
    pub async fn confirm_booking(
        self: &Arc<Self>,
        booking_id: BookingId,
        user: UserId,
        payment_reference: String,
    ) -> Result<Reservation, BookingError> {
        let saga = self
            .db
            .get_by_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;
        if saga.user_id != user {
            return Err(BookingError::Forbidden);
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_confirm_pipeline(saga, payment_reference).await
        });
        handle
            .await
            .map_err(|e| BookingError::Internal(format!("confirm pipeline panicked: {e}")))?
    }

    async fn run_confirm_pipeline(
        &self,
        saga: SagaInstance,
        payment_reference: String,
    ) -> Result<Reservation, BookingError> {
        let (ctx, reservation) = self.rebuild_context(&saga).await?;
        let ctx = ctx.with_payment_reference(payment_reference);

        match saga.state {
            SagaState::Reserved => {
                // The hold must still be claimable before we charge.
                match reservation.status {
                    ReservationStatus::Reserved => {}
                    ReservationStatus::Confirmed => return Err(BookingError::AlreadyConfirmed),
                    ReservationStatus::Cancelled => return Err(BookingError::AlreadyReleased),
                    ReservationStatus::Expired => return Err(BookingError::Expired),
                }
                if reservation.expires_at <= chrono::Utc::now() {
                    return Err(BookingError::Expired);
                }
                self.advance_from_reserved(&ctx).await
            }
            // Crash recovery path: charged but never confirmed.
            SagaState::Paid => self.advance_from_paid(&ctx).await,
            SagaState::Confirmed => Err(BookingError::AlreadyConfirmed),
            SagaState::Cancelled => Err(BookingError::AlreadyReleased),
            SagaState::Failed => match reservation.status {
                ReservationStatus::Expired => Err(BookingError::Expired),
                _ => Err(BookingError::AlreadyReleased),
            },
            SagaState::Created => Err(BookingError::NotFound("reservation pending".into())),
        }
    }

    async fn advance_from_reserved(&self, ctx: &SagaContext) -> Result<Reservation, BookingError> {
        match self.run_step(&self.pay, ctx).await {
            Ok(output) => {
                self.complete_step(ctx, &self.pay, SagaState::Reserved, &output)
                    .await?;
            }
            Err(step_err) => {
                let err = step_err.into_booking_error();
                self.compensate_all(ctx, &[&self.reserve]).await;
                self.fail_saga(ctx, SagaState::Reserved, &err.to_string()).await;
                return Err(err);
            }
        }
        self.advance_from_paid(ctx).await
    }

    async fn advance_from_paid(&self, ctx: &SagaContext) -> Result<Reservation, BookingError> {
        match self.run_step(&self.confirm, ctx).await {
            Ok(output) => {
                self.complete_step(ctx, &self.confirm, SagaState::Paid, &output)
                    .await?;
            }
            Err(step_err) => {
                let err = step_err.into_booking_error();
                self.compensate_all(ctx, &[&self.reserve, &self.pay]).await;
                self.fail_saga(ctx, SagaState::Paid, &err.to_string()).await;
                return Err(err);
            }
        }

        // Non-critical tail: never compensates, never fails the saga. A
        // lost enqueue is caught later by the recovery worker's re-notify
        // sweep.
        if let Err(e) = self.run_step(&self.notify, ctx).await {
            warn!(
                saga_id = %ctx.saga_id,
                error = %e,
                "Notification enqueue failed; the re-notify sweep will retry it"
            );
        }

        ctx.reservation()
            .ok_or_else(|| BookingError::Internal("confirm step lost its output".into()))
    }

    /// User-initiated release. Restores inventory and cancels the saga.
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        user: UserId,
    ) -> Result<Reservation, BookingError> {
        let released = self.engine.release(booking_id, user).await?;

        if let Some(saga) = self.db.get_by_booking(booking_id).await? {
            match saga.state {
                SagaState::Created | SagaState::Reserved => {
                    if let Err(e) = self
                        .db
                        .transition(saga.id, saga.state, SagaState::Cancelled, "user release")
                        .await
                    {
                        warn!(saga_id = %saga.id, error = %e, "Cancel transition failed");
                    }
                }
                SagaState::Paid => {
                    // Released between charge and confirm: refund the charge.
                    let (ctx, _) = self.rebuild_context(&saga).await?;
                    self.compensate_all(&ctx, &[&self.pay]).await;
                    self.fail_saga(&ctx, SagaState::Paid, "released after payment").await;
                }
                _ => {}
            }
        }
        Ok(released)
    }

    // ========================================================
    // Recovery
    // ========================================================

    /// Resume or fail a stale non-terminal saga. Returns the state it ends
    /// in.
    pub async fn recover(&self, saga: &SagaInstance) -> Result<SagaState, BookingError> {
        match saga.state {
            SagaState::Created => {
                // Step 1 never recorded an output. If the reserve actually
                // committed, the reservation TTL and the reaper settle the
                // inventory; the saga itself cannot proceed.
                self.db
                    .set_error(saga.id, "recovery: reserve step never completed")
                    .await?;
                self.db
                    .transition(saga.id, SagaState::Created, SagaState::Failed, "recovery")
                    .await?;
                Ok(SagaState::Failed)
            }
            SagaState::Reserved => {
                // Waiting on the user to pay. Only fail the saga once the
                // hold itself is gone.
                let (ctx, reservation) = self.rebuild_context(saga).await?;
                match reservation.status {
                    ReservationStatus::Reserved => Ok(SagaState::Reserved),
                    ReservationStatus::Confirmed => {
                        // Confirmed outside the saga; converge.
                        self.db
                            .transition(saga.id, SagaState::Reserved, SagaState::Paid, "recovery")
                            .await?;
                        self.db
                            .transition(saga.id, SagaState::Paid, SagaState::Confirmed, "recovery")
                            .await?;
                        Ok(SagaState::Confirmed)
                    }
                    ReservationStatus::Cancelled => {
                        self.db
                            .transition(
                                saga.id,
                                SagaState::Reserved,
                                SagaState::Cancelled,
                                "recovery: hold released",
                            )
                            .await?;
                        Ok(SagaState::Cancelled)
                    }
                    ReservationStatus::Expired => {
                        self.compensate_all(&ctx, &[&self.reserve]).await;
                        self.fail_saga(&ctx, SagaState::Reserved, "recovery: hold expired")
                            .await;
                        Ok(SagaState::Failed)
                    }
                }
            }
            SagaState::Paid => {
                // Charged but never confirmed; finish the job.
                let (ctx, _) = self.rebuild_context(saga).await?;
                match self.advance_from_paid(&ctx).await {
                    Ok(_) => Ok(SagaState::Confirmed),
                    Err(_) => Ok(SagaState::Failed),
                }
            }
            terminal => Ok(terminal),
        }
    }

    /// Re-run the notification enqueue for a CONFIRMED saga that has no
    /// `booking.notification` outbox row on record. Duplicate enqueues are
    /// safe: delivery is at-least-once and consumers are idempotent.
    pub async fn renotify(&self, saga: &SagaInstance) -> Result<(), BookingError> {
        let (ctx, _) = self.rebuild_context(saga).await?;
        match self.run_step(&self.notify, &ctx).await {
            Ok(_) => {
                info!(saga_id = %saga.id, "Notification re-enqueued");
                Ok(())
            }
            Err(e) => Err(e.into_booking_error()),
        }
    }

    /// Rebuild a step context from persisted state.
    async fn rebuild_context(
        &self,
        saga: &SagaInstance,
    ) -> Result<(SagaContext, Reservation), BookingError> {
        let reservation_id = saga
            .reservation_id
            .ok_or_else(|| BookingError::Internal("saga has no reservation".into()))?;
        let reservation = self.engine.get(reservation_id).await?;

        let spec = ReserveSpec {
            event_id: reservation.event_id,
            show_id: reservation.show_id,
            zone_id: reservation.zone_id,
            quantity: reservation.quantity,
            unit_price: Some(reservation.unit_price),
        };
        let ctx = SagaContext::new(
            saga.id,
            saga.user_id,
            spec,
            reservation.idempotency_key.clone(),
            None,
        );
        ctx.set_reservation(reservation.clone());
        if let Some(payment_id) = saga.payment_id {
            ctx.record(&StepOutput::Paid { payment_id });
        }
        Ok((ctx, reservation))
    }
}
