//! Saga persistence
//!
//! One row per saga instance plus an append-only transition log. Every
//! state change is an atomic CAS on the expected from-state, written in the
//! same transaction as the transition-log row.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::bus::events;
use crate::core_types::{BookingId, EventId, PaymentId, SagaId, UserId};
use crate::errors::BookingError;

use super::state::SagaState;
use super::step::StepOutput;

#[derive(Debug, Clone)]
pub struct SagaInstance {
    pub id: SagaId,
    pub booking_id: Option<BookingId>,
    pub user_id: UserId,
    pub event_id: EventId,
    pub state: SagaState,
    pub previous_state: Option<SagaState>,
    pub reservation_id: Option<BookingId>,
    pub payment_id: Option<PaymentId>,
    pub confirmation_code: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SagaDb {
    pool: PgPool,
}

impl SagaDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persist a new saga in CREATED before step 1 runs.
    pub async fn insert(
        &self,
        id: SagaId,
        user: UserId,
        event: EventId,
    ) -> Result<(), BookingError> {
        sqlx::query(
            r#"
            INSERT INTO saga_instances
                (id, user_id, event_id, state, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(user)
        .bind(event)
        .bind(SagaState::Created.id())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>, BookingError> {
        let row = sqlx::query(&select_query("id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_instance(&r)).transpose()
    }

    pub async fn get_by_booking(
        &self,
        booking: BookingId,
    ) -> Result<Option<SagaInstance>, BookingError> {
        let row = sqlx::query(&select_query("booking_id = $1"))
            .bind(booking)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_instance(&r)).transpose()
    }

    /// Atomic CAS transition with a transition-log row, both or neither.
    /// Returns false when another worker already moved the saga.
    pub async fn transition(
        &self,
        id: SagaId,
        from: SagaState,
        to: SagaState,
        reason: &str,
    ) -> Result<bool, BookingError> {
        if !SagaState::valid_transition(from, to) {
            return Err(BookingError::Internal(format!(
                "illegal saga transition {from} -> {to}"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET state = $1, previous_state = $2, updated_at = NOW()
            WHERE id = $3 AND state = $2
            "#,
        )
        .bind(to.id())
        .bind(from.id())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO saga_transitions (saga_id, from_state, to_state, reason, occurred_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(id)
        .bind(from.id())
        .bind(to.id())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Persist a completed step's output onto the instance row.
    pub async fn record_output(
        &self,
        id: SagaId,
        output: &StepOutput,
    ) -> Result<(), BookingError> {
        match output {
            StepOutput::Reserved { reservation_id, .. } => {
                sqlx::query(
                    r#"
                    UPDATE saga_instances
                    SET booking_id = $1, reservation_id = $1, updated_at = NOW()
                    WHERE id = $2
                    "#,
                )
                .bind(reservation_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            StepOutput::Paid { payment_id } => {
                sqlx::query(
                    r#"
                    UPDATE saga_instances
                    SET payment_id = $1, updated_at = NOW()
                    WHERE id = $2
                    "#,
                )
                .bind(payment_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            StepOutput::Confirmed { confirmation_code } => {
                sqlx::query(
                    r#"
                    UPDATE saga_instances
                    SET confirmation_code = $1, updated_at = NOW()
                    WHERE id = $2
                    "#,
                )
                .bind(confirmation_code)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            StepOutput::Notified => {}
        }
        Ok(())
    }

    pub async fn set_error(&self, id: SagaId, error: &str) -> Result<(), BookingError> {
        sqlx::query(
            r#"
            UPDATE saga_instances
            SET error_message = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_retry(&self, id: SagaId) -> Result<(), BookingError> {
        sqlx::query(
            r#"
            UPDATE saga_instances
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-terminal sagas untouched for longer than `threshold`.
    pub async fn find_stale(
        &self,
        threshold: Duration,
        limit: i64,
    ) -> Result<Vec<SagaInstance>, BookingError> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY updated_at ASC LIMIT $2",
            select_query(
                "state NOT IN (30, -10, -20) AND updated_at < NOW() - make_interval(secs => $1)"
            )
        ))
        .bind(threshold.as_secs() as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }

    /// CONFIRMED sagas whose notification was never enqueued (the outbox
    /// insert itself failed past the step budget, so the dispatcher has
    /// nothing to retry). `threshold` keeps the sweep off sagas whose
    /// notify step may still be in flight.
    pub async fn find_unnotified_confirmed(
        &self,
        threshold: Duration,
        limit: i64,
    ) -> Result<Vec<SagaInstance>, BookingError> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY updated_at ASC LIMIT $3",
            select_query(
                "state = 30
                   AND booking_id IS NOT NULL
                   AND updated_at < NOW() - make_interval(secs => $1)
                   AND NOT EXISTS (
                       SELECT 1 FROM outbox_events o
                       WHERE o.aggregate_type = 'booking'
                         AND o.aggregate_id = saga_instances.booking_id::text
                         AND o.event_type = $2
                   )"
            )
        ))
        .bind(threshold.as_secs() as f64)
        .bind(events::BOOKING_NOTIFICATION)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }
}

fn select_query(predicate: &str) -> String {
    format!(
        r#"
        SELECT id, booking_id, user_id, event_id, state, previous_state,
               reservation_id, payment_id, confirmation_code,
               retry_count, error_message, created_at, updated_at
        FROM saga_instances
        WHERE {predicate}
        "#
    )
}

fn row_to_instance(row: &PgRow) -> Result<SagaInstance, BookingError> {
    let state_id: i16 = row.get("state");
    let state = SagaState::from_id(state_id)
        .ok_or_else(|| BookingError::Internal(format!("invalid saga state {state_id}")))?;
    let previous_state = row
        .get::<Option<i16>, _>("previous_state")
        .and_then(SagaState::from_id);

    Ok(SagaInstance {
        id: row.get("id"),
        booking_id: row.get("booking_id"),
        user_id: row.get("user_id"),
        event_id: row.get("event_id"),
        state,
        previous_state,
        reservation_id: row.get("reservation_id"),
        payment_id: row.get("payment_id"),
        confirmation_code: row.get("confirmation_code"),
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
