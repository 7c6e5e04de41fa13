//! Reservation persistence
//!
//! Runtime-bound queries against the `reservations` table. All status
//! changes are CAS updates guarded by the current status, so concurrent
//! confirm/expire/release races resolve to exactly one winner.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::core_types::BookingId;
use crate::errors::BookingError;
use crate::models::{Reservation, ReservationStatus};

pub struct ReservationDb {
    pool: PgPool,
}

impl ReservationDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a freshly reserved row inside the caller's transaction.
    pub async fn insert_reserved(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        res: &Reservation,
    ) -> Result<(), BookingError> {
        sqlx::query(
            r#"
            INSERT INTO reservations
                (id, user_id, event_id, show_id, zone_id, quantity, unit_price, total,
                 status, reserved_at, expires_at, confirmation_code, idempotency_key,
                 event_name, show_name, zone_name, venue, zone_capacity, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8,
                 $9, $10, $11, $12, $13,
                 $14, $15, $16, $17, $18, NOW())
            "#,
        )
        .bind(res.id)
        .bind(res.user_id)
        .bind(res.event_id)
        .bind(res.show_id)
        .bind(res.zone_id)
        .bind(res.quantity)
        .bind(res.unit_price)
        .bind(res.total)
        .bind(res.status.id())
        .bind(res.reserved_at)
        .bind(res.expires_at)
        .bind(&res.confirmation_code)
        .bind(&res.idempotency_key)
        .bind(&res.event_name)
        .bind(&res.show_name)
        .bind(&res.zone_name)
        .bind(&res.venue)
        .bind(res.zone_capacity)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: BookingId) -> Result<Option<Reservation>, BookingError> {
        let row = sqlx::query(SELECT_RESERVATION)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_reservation(&r)).transpose()
    }

    /// Idempotent replay lookup. The unique index on `idempotency_key` is
    /// the data-layer line of defense behind this read.
    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Reservation>, BookingError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, event_id, show_id, zone_id, quantity, unit_price, total,
                   status, reserved_at, expires_at, confirmation_code, idempotency_key,
                   event_name, show_name, zone_name, venue, zone_capacity
            FROM reservations
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_reservation(&r)).transpose()
    }

    /// CAS: RESERVED → `new_status`. Returns true if this caller won.
    pub async fn update_status_if_reserved(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: BookingId,
        new_status: ReservationStatus,
    ) -> Result<bool, BookingError> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(new_status.id())
        .bind(id)
        .bind(ReservationStatus::Reserved.id())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// CAS: RESERVED → CONFIRMED, assigning the confirmation code.
    pub async fn confirm_if_reserved(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: BookingId,
        confirmation_code: &str,
    ) -> Result<bool, BookingError> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = $1, confirmation_code = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(ReservationStatus::Confirmed.id())
        .bind(confirmation_code)
        .bind(id)
        .bind(ReservationStatus::Reserved.id())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// RESERVED rows whose TTL elapsed, oldest expiry first.
    pub async fn find_expired(&self, limit: i64) -> Result<Vec<Reservation>, BookingError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, event_id, show_id, zone_id, quantity, unit_price, total,
                   status, reserved_at, expires_at, confirmation_code, idempotency_key,
                   event_name, show_name, zone_name, venue, zone_capacity
            FROM reservations
            WHERE status = $1 AND expires_at <= NOW()
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(ReservationStatus::Reserved.id())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reservation).collect()
    }
}

const SELECT_RESERVATION: &str = r#"
SELECT id, user_id, event_id, show_id, zone_id, quantity, unit_price, total,
       status, reserved_at, expires_at, confirmation_code, idempotency_key,
       event_name, show_name, zone_name, venue, zone_capacity
FROM reservations
WHERE id = $1
"#;

fn row_to_reservation(row: &PgRow) -> Result<Reservation, BookingError> {
    let status_id: i16 = row.get("status");
    let status = ReservationStatus::from_id(status_id)
        .ok_or_else(|| BookingError::Internal(format!("invalid reservation status {status_id}")))?;

    let reserved_at: DateTime<Utc> = row.get("reserved_at");
    let expires_at: DateTime<Utc> = row.get("expires_at");

    Ok(Reservation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        event_id: row.get("event_id"),
        show_id: row.get("show_id"),
        zone_id: row.get("zone_id"),
        quantity: row.get("quantity"),
        unit_price: row.get("unit_price"),
        total: row.get("total"),
        status,
        reserved_at,
        expires_at,
        confirmation_code: row.get("confirmation_code"),
        idempotency_key: row.get("idempotency_key"),
        event_name: row.get("event_name"),
        show_name: row.get("show_name"),
        zone_name: row.get("zone_name"),
        venue: row.get("venue"),
        zone_capacity: row.get("zone_capacity"),
    })
}
