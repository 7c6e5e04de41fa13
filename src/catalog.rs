//! Catalog collaborator
//!
//! Event/show/zone CRUD lives outside this service; the booking hot path
//! only needs a read-side snapshot of one zone (names, venue, unit price,
//! capacity, per-user cap). [`SnapshotCache`] bounds the freshness of that
//! read so a flash sale does not hammer the catalog tables.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

use crate::config::timeouts;
use crate::core_types::{EventId, ShowId, ZoneId};
use crate::errors::BookingError;

/// Read-side view of one zone, denormalized onto reservations at reserve
/// time.
#[derive(Debug, Clone)]
pub struct ZoneSnapshot {
    pub event_id: EventId,
    pub show_id: ShowId,
    pub zone_id: ZoneId,
    pub event_name: String,
    pub show_name: String,
    pub zone_name: String,
    pub venue: String,
    pub unit_price: Decimal,
    pub capacity: i64,
    pub max_per_user: i64,
    pub on_sale: bool,
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Fetch the snapshot for a zone, verifying it belongs to the given
    /// show and event.
    async fn zone_snapshot(
        &self,
        event: &EventId,
        show: &ShowId,
        zone: &ZoneId,
    ) -> Result<ZoneSnapshot, BookingError>;
}

/// Postgres-backed catalog reader.
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogProvider for PgCatalog {
    async fn zone_snapshot(
        &self,
        event: &EventId,
        show: &ShowId,
        zone: &ZoneId,
    ) -> Result<ZoneSnapshot, BookingError> {
        let row = sqlx::query(
            r#"
            SELECT e.event_id, e.name AS event_name, e.venue, e.max_tickets_per_user, e.on_sale,
                   s.show_id, s.name AS show_name,
                   z.zone_id, z.name AS zone_name, z.unit_price, z.capacity
            FROM zones z
            JOIN shows s ON s.show_id = z.show_id
            JOIN events e ON e.event_id = s.event_id
            WHERE z.zone_id = $1 AND s.show_id = $2 AND e.event_id = $3
            "#,
        )
        .bind(zone)
        .bind(show)
        .bind(event)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BookingError::NotFound(format!("zone {zone}")))?;

        Ok(ZoneSnapshot {
            event_id: row.get("event_id"),
            show_id: row.get("show_id"),
            zone_id: row.get("zone_id"),
            event_name: row.get("event_name"),
            show_name: row.get("show_name"),
            zone_name: row.get("zone_name"),
            venue: row.get("venue"),
            unit_price: row.get("unit_price"),
            capacity: row.get::<i32, _>("capacity") as i64,
            max_per_user: row.get::<i32, _>("max_tickets_per_user") as i64,
            on_sale: row.get("on_sale"),
        })
    }
}

/// In-memory catalog for tests and standalone mode.
#[derive(Default)]
pub struct StaticCatalog {
    zones: Mutex<Vec<ZoneSnapshot>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: ZoneSnapshot) {
        self.zones.lock().unwrap().push(snapshot);
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn zone_snapshot(
        &self,
        event: &EventId,
        show: &ShowId,
        zone: &ZoneId,
    ) -> Result<ZoneSnapshot, BookingError> {
        self.zones
            .lock()
            .unwrap()
            .iter()
            .find(|z| z.zone_id == *zone && z.show_id == *show && z.event_id == *event)
            .cloned()
            .ok_or_else(|| BookingError::NotFound(format!("zone {zone}")))
    }
}

/// Bounded-freshness cache in front of any provider.
///
/// The hot path may serve a snapshot up to the configured lifespan old;
/// capacity and per-user caps change rarely and never mid-sale.
pub struct SnapshotCache {
    inner: Arc<dyn CatalogProvider>,
    cache: Mutex<TimedCache<ZoneId, ZoneSnapshot>>,
}

impl SnapshotCache {
    pub fn new(inner: Arc<dyn CatalogProvider>, lifespan_secs: u64) -> Self {
        Self {
            inner,
            cache: Mutex::new(TimedCache::with_lifespan(lifespan_secs.max(1))),
        }
    }
}

#[async_trait]
impl CatalogProvider for SnapshotCache {
    async fn zone_snapshot(
        &self,
        event: &EventId,
        show: &ShowId,
        zone: &ZoneId,
    ) -> Result<ZoneSnapshot, BookingError> {
        if let Some(hit) = self.cache.lock().unwrap().cache_get(zone) {
            if hit.show_id == *show && hit.event_id == *event {
                return Ok(hit.clone());
            }
        }

        let snapshot = tokio::time::timeout(
            timeouts::CATALOG,
            self.inner.zone_snapshot(event, show, zone),
        )
        .await
        .map_err(|_| BookingError::ServiceUnavailable("catalog read timed out".into()))??;

        self.cache
            .lock()
            .unwrap()
            .cache_set(*zone, snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) fn snapshot(event: EventId, show: ShowId, zone: ZoneId) -> ZoneSnapshot {
        ZoneSnapshot {
            event_id: event,
            show_id: show,
            zone_id: zone,
            event_name: "The Big Show".into(),
            show_name: "Night 1".into(),
            zone_name: "Floor A".into(),
            venue: "Main Arena".into(),
            unit_price: Decimal::new(7500, 2),
            capacity: 100,
            max_per_user: 4,
            on_sale: true,
        }
    }

    #[tokio::test]
    async fn test_static_catalog_lookup() {
        let catalog = StaticCatalog::new();
        let (e, s, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        catalog.insert(snapshot(e, s, z));

        let got = catalog.zone_snapshot(&e, &s, &z).await.unwrap();
        assert_eq!(got.zone_name, "Floor A");

        let miss = catalog.zone_snapshot(&e, &s, &Uuid::new_v4()).await;
        assert!(matches!(miss, Err(BookingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cache_serves_hit() {
        let catalog = Arc::new(StaticCatalog::new());
        let (e, s, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        catalog.insert(snapshot(e, s, z));

        let cache = SnapshotCache::new(catalog.clone(), 60);
        let first = cache.zone_snapshot(&e, &s, &z).await.unwrap();

        // Mutating the source is invisible within the freshness bound.
        catalog.zones.lock().unwrap().clear();
        let second = cache.zone_snapshot(&e, &s, &z).await.unwrap();
        assert_eq!(first.zone_name, second.zone_name);
    }

    #[tokio::test]
    async fn test_cache_rejects_mismatched_parents() {
        let catalog = Arc::new(StaticCatalog::new());
        let (e, s, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        catalog.insert(snapshot(e, s, z));

        let cache = SnapshotCache::new(catalog, 60);
        cache.zone_snapshot(&e, &s, &z).await.unwrap();

        // Same zone id under the wrong event must not be served from cache.
        let wrong = cache.zone_snapshot(&Uuid::new_v4(), &s, &z).await;
        assert!(wrong.is_err());
    }
}
