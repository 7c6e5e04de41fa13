//! Startup inventory sync
//!
//! Copies relational zone inventory into the fast store before the sale
//! opens. Write-if-absent: when the process restarts mid-sale the live
//! counter in the fast store is authoritative and must not be overwritten
//! by the (stale) relational value.

use std::sync::Arc;

use sqlx::{PgPool, Row};

use crate::errors::BookingError;

use super::FastStore;

/// Seed `zone:availability:{zone_id}` for every on-sale zone.
///
/// Returns how many zones were newly seeded.
pub async fn sync_zone_inventory(
    pool: &PgPool,
    store: &Arc<dyn FastStore>,
) -> Result<u64, BookingError> {
    let rows = sqlx::query(
        r#"
        SELECT z.zone_id, z.available
        FROM zones z
        JOIN shows s ON s.show_id = z.show_id
        JOIN events e ON e.event_id = s.event_id
        WHERE e.on_sale = TRUE
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut seeded = 0u64;
    for row in &rows {
        let zone_id: uuid::Uuid = row.get("zone_id");
        let available: i64 = row.get("available");

        if store.init_zone(&zone_id, available).await? {
            seeded += 1;
            tracing::info!(zone_id = %zone_id, available, "Seeded zone availability");
        } else {
            tracing::info!(
                zone_id = %zone_id,
                "Zone counter already live in fast store, keeping it"
            );
        }
    }

    tracing::info!(
        zones = rows.len(),
        seeded,
        "Zone inventory sync complete"
    );
    Ok(seeded)
}
