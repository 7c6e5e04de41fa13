//! Concrete booking saga steps
//!
//! | # | Step             | Forward                     | Compensation          |
//! |---|------------------|-----------------------------|-----------------------|
//! | 1 | ReserveSeats     | engine.reserve              | release + CANCELLED   |
//! | 2 | ProcessPayment   | gateway.charge              | refund                |
//! | 3 | ConfirmBooking   | engine.confirm              | (terminal write)      |
//! | 4 | SendNotification | enqueue via outbox          | (non-critical)        |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::bus::events;
use crate::errors::BookingError;
use crate::outbox::{self, NewOutboxEvent};
use crate::payment::{ChargeRequest, PaymentError, PaymentGateway, PaymentOutcome};
use crate::reservation::ReservationEngine;

use super::state::SagaState;
use super::step::{SagaContext, SagaStep, StepError, StepOutput};

// ============================================================
// 1. ReserveSeats
// ============================================================

pub struct ReserveSeats {
    engine: Arc<ReservationEngine>,
    pool: PgPool,
    outbox_max_retries: i32,
}

impl ReserveSeats {
    pub fn new(engine: Arc<ReservationEngine>, pool: PgPool, outbox_max_retries: i32) -> Self {
        Self {
            engine,
            pool,
            outbox_max_retries,
        }
    }
}

#[async_trait]
impl SagaStep for ReserveSeats {
    fn name(&self) -> &'static str {
        "reserve_seats"
    }

    fn completed_state(&self) -> SagaState {
        SagaState::Reserved
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepOutput, StepError> {
        let reservation = self
            .engine
            .reserve(
                ctx.user,
                &ctx.spec,
                &ctx.idempotency_key,
                ctx.queue_pass.as_deref(),
            )
            .await?;

        let output = StepOutput::Reserved {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
            total: reservation.total,
        };
        ctx.set_reservation(reservation);
        Ok(output)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let Some(booking_id) = ctx.reservation_id() else {
            return Ok(()); // nothing was reserved
        };

        match self.engine.release_for_compensation(booking_id).await {
            Ok(_) => {
                if let Err(e) = outbox::insert_standalone(
                    &self.pool,
                    &NewOutboxEvent::payment_event(
                        events::PAYMENT_SEAT_RELEASE,
                        &booking_id,
                        serde_json::json!({ "booking_id": booking_id, "reason": "compensation" }),
                    ),
                    self.outbox_max_retries,
                )
                .await
                {
                    warn!(booking_id = %booking_id, error = %e, "Seat-release event write failed");
                }
                Ok(())
            }
            // Someone else already moved the row; inventory is settled.
            Err(
                BookingError::AlreadyReleased
                | BookingError::Expired
                | BookingError::AlreadyConfirmed,
            ) => Ok(()),
            Err(e) => Err(StepError::from(e)),
        }
    }
}

// ============================================================
// 2. ProcessPayment
// ============================================================

pub struct ProcessPayment {
    gateway: Arc<dyn PaymentGateway>,
    pool: PgPool,
    outbox_max_retries: i32,
}

impl ProcessPayment {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        outbox_max_retries: i32,
    ) -> Self {
        Self {
            gateway,
            pool,
            outbox_max_retries,
        }
    }

    async fn record_payment(
        &self,
        ctx: &SagaContext,
        payment_id: uuid::Uuid,
        status: &str,
    ) -> Result<(), StepError> {
        let reservation = ctx
            .reservation()
            .ok_or_else(|| StepError::Definitive("payment without reservation".into()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, user_id, amount, status, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(payment_id)
        .bind(reservation.id)
        .bind(ctx.user)
        .bind(reservation.total)
        .bind(status)
        .bind(ctx.payment_reference.as_deref().unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(|e| StepError::Transient(e.to_string()))?;

        let event_type = if status == "SUCCESS" {
            events::PAYMENT_SUCCESS
        } else {
            events::PAYMENT_FAILED
        };
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::payment_event(
                event_type,
                &reservation.id,
                serde_json::json!({
                    "booking_id": reservation.id,
                    "payment_id": payment_id,
                    "amount": reservation.total,
                    "status": status,
                }),
            ),
            self.outbox_max_retries,
        )
        .await
        .map_err(StepError::from)?;

        tx.commit()
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SagaStep for ProcessPayment {
    fn name(&self) -> &'static str {
        "process_payment"
    }

    fn completed_state(&self) -> SagaState {
        SagaState::Paid
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepOutput, StepError> {
        let reservation = ctx
            .reservation()
            .ok_or_else(|| StepError::Definitive("payment without reservation".into()))?;
        let reference = ctx
            .payment_reference
            .clone()
            .ok_or_else(|| StepError::Domain(BookingError::InvalidRequest(
                "payment reference required".into(),
            )))?;

        let request = ChargeRequest {
            booking_id: reservation.id,
            user_id: ctx.user,
            amount: reservation.total,
            currency: "USD".into(),
            reference,
        };

        match self.gateway.charge(&request).await {
            Ok(PaymentOutcome::Approved { payment_id }) => {
                self.record_payment(ctx, payment_id, "SUCCESS").await?;
                info!(
                    booking_id = %reservation.id,
                    payment_id = %payment_id,
                    "Payment captured"
                );
                Ok(StepOutput::Paid { payment_id })
            }
            Ok(PaymentOutcome::Declined { reason }) => {
                self.record_payment(ctx, uuid::Uuid::new_v4(), "DECLINED")
                    .await?;
                Err(StepError::Domain(BookingError::PaymentDeclined(reason)))
            }
            Err(PaymentError::Transient(msg)) => Err(StepError::Transient(msg)),
            Err(PaymentError::Rejected(msg)) => Err(StepError::Definitive(msg)),
        }
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let Some(payment_id) = ctx.payment_id() else {
            return Ok(()); // nothing was charged
        };

        match self.gateway.refund(&payment_id).await {
            Ok(()) => {
                sqlx::query("UPDATE payments SET status = 'REFUNDED' WHERE id = $1")
                    .bind(payment_id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StepError::Transient(e.to_string()))?;
                info!(payment_id = %payment_id, "Payment refunded");
                Ok(())
            }
            Err(PaymentError::Transient(msg)) => Err(StepError::Transient(msg)),
            Err(PaymentError::Rejected(msg)) => Err(StepError::Definitive(msg)),
        }
    }
}

// ============================================================
// 3. ConfirmBooking
// ============================================================

pub struct ConfirmBooking {
    engine: Arc<ReservationEngine>,
}

impl ConfirmBooking {
    pub fn new(engine: Arc<ReservationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl SagaStep for ConfirmBooking {
    fn name(&self) -> &'static str {
        "confirm_booking"
    }

    fn completed_state(&self) -> SagaState {
        SagaState::Confirmed
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepOutput, StepError> {
        let booking_id = ctx
            .reservation_id()
            .ok_or_else(|| StepError::Definitive("confirm without reservation".into()))?;

        let confirmed = self.engine.confirm(booking_id, ctx.user).await?;
        let code = confirmed
            .confirmation_code
            .clone()
            .ok_or_else(|| StepError::Definitive("confirmed without code".into()))?;
        ctx.set_reservation(confirmed);
        Ok(StepOutput::Confirmed {
            confirmation_code: code,
        })
    }

    async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepError> {
        // Terminal write; once confirmed there is nothing to undo.
        Ok(())
    }
}

// ============================================================
// 4. SendNotification
// ============================================================

pub struct SendNotification {
    engine: Arc<ReservationEngine>,
    pool: PgPool,
    outbox_max_retries: i32,
}

impl SendNotification {
    pub fn new(engine: Arc<ReservationEngine>, pool: PgPool, outbox_max_retries: i32) -> Self {
        Self {
            engine,
            pool,
            outbox_max_retries,
        }
    }
}

#[async_trait]
impl SagaStep for SendNotification {
    fn name(&self) -> &'static str {
        "send_notification"
    }

    fn completed_state(&self) -> SagaState {
        SagaState::Confirmed
    }

    fn critical(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepOutput, StepError> {
        let booking_id = ctx
            .reservation_id()
            .ok_or_else(|| StepError::Definitive("notify without reservation".into()))?;
        let reservation = self.engine.get(booking_id).await?;

        // Delivery is someone else's job; the outbox retry machinery makes
        // the enqueue itself reliable.
        outbox::insert_standalone(
            &self.pool,
            &NewOutboxEvent::booking_notification(&reservation),
            self.outbox_max_retries,
        )
        .await
        .map_err(StepError::from)?;

        Ok(StepOutput::Notified)
    }

    async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepError> {
        Ok(())
    }
}
