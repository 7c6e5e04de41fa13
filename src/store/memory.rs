//! In-memory fast store
//!
//! Executes the exact algorithms of the Redis scripts under a single mutex,
//! which gives the same total order the Redis server's single-threaded
//! execution gives. Used by tests and by standalone mode (no Redis).
//!
//! TTLs are enforced lazily: expired entries are purged when touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core_types::{BookingId, EventId, UserId, ZoneId};
use crate::errors::BookingError;

use super::{
    FastStore, QueueTicket, RELEASE_MARKER_TTL_SECS, ReleaseArgs, ReserveArgs, ScriptReply,
};

#[derive(Default)]
struct Inner {
    /// zone -> available
    zones: HashMap<ZoneId, i64>,
    /// (user, event) -> (held, expires)
    user_counts: HashMap<(UserId, EventId), (i64, Instant)>,
    /// booking -> record expiry
    records: HashMap<BookingId, Instant>,
    /// booking -> marker expiry
    release_markers: HashMap<BookingId, Instant>,
    /// event -> ordered (joined_at_ms, user-id string); the string member
    /// breaks score ties exactly like the Redis sorted set
    queues: HashMap<EventId, BTreeSet<(i64, String)>>,
    tickets: HashMap<(EventId, UserId), QueueTicket>,
    admitted: HashMap<EventId, u64>,
    /// jti -> marker expiry
    passes: HashMap<String, Instant>,
    /// key -> (stored response, expiry)
    idem: HashMap<String, (String, Instant)>,
}

impl Inner {
    fn user_held(&mut self, user: &UserId, event: &EventId, now: Instant) -> i64 {
        match self.user_counts.get(&(*user, *event)) {
            Some((_, expires)) if *expires <= now => {
                self.user_counts.remove(&(*user, *event));
                0
            }
            Some((held, _)) => *held,
            None => 0,
        }
    }

    fn record_alive(&mut self, booking: &BookingId, now: Instant) -> bool {
        match self.records.get(booking) {
            Some(expires) if *expires <= now => {
                self.records.remove(booking);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn marker_alive(&mut self, booking: &BookingId, now: Instant) -> bool {
        match self.release_markers.get(booking) {
            Some(expires) if *expires <= now => {
                self.release_markers.remove(booking);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Mutex-serialized fast store with Redis-script semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn init_zone(&self, zone: &ZoneId, available: i64) -> Result<bool, BookingError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.zones.contains_key(zone) {
            return Ok(false);
        }
        inner.zones.insert(*zone, available);
        Ok(true)
    }

    async fn zone_available(&self, zone: &ZoneId) -> Result<Option<i64>, BookingError> {
        Ok(self.inner.lock().unwrap().zones.get(zone).copied())
    }

    async fn reserve(&self, args: &ReserveArgs) -> Result<ScriptReply, BookingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if args.quantity <= 0 {
            return Ok(ScriptReply::reject("INVALID_QUANTITY", 0));
        }
        let Some(&available) = inner.zones.get(&args.zone) else {
            return Ok(ScriptReply::reject("ZONE_NOT_FOUND", 0));
        };
        let held = inner.user_held(&args.user, &args.event, now);
        if held + args.quantity > args.max_per_user {
            return Ok(ScriptReply::reject("USER_LIMIT_EXCEEDED", held));
        }
        if available < args.quantity {
            return Ok(ScriptReply::reject("INSUFFICIENT_STOCK", available));
        }

        let remaining = available - args.quantity;
        inner.zones.insert(args.zone, remaining);
        inner
            .user_counts
            .insert((args.user, args.event), (held + args.quantity, now + args.ttl));
        inner.records.insert(args.booking, now + args.ttl);
        Ok(ScriptReply::ok(remaining))
    }

    async fn release(&self, args: &ReleaseArgs) -> Result<ScriptReply, BookingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if inner.marker_alive(&args.booking, now) {
            return Ok(ScriptReply::reject("ALREADY_RELEASED", 0));
        }
        inner.release_markers.insert(
            args.booking,
            now + Duration::from_secs(RELEASE_MARKER_TTL_SECS),
        );

        let available = inner.zones.get(&args.zone).copied().unwrap_or(0);
        let restored = (available + args.quantity).min(args.capacity);
        inner.zones.insert(args.zone, restored);

        let held = inner.user_held(&args.user, &args.event, now) - args.quantity;
        if held > 0 {
            // Keep the original expiry, like SET KEEPTTL.
            if let Some(entry) = inner.user_counts.get_mut(&(args.user, args.event)) {
                entry.0 = held;
            }
        } else {
            inner.user_counts.remove(&(args.user, args.event));
        }

        inner.records.remove(&args.booking);
        Ok(ScriptReply::ok(restored))
    }

    async fn user_reserved_count(
        &self,
        user: &UserId,
        event: &EventId,
    ) -> Result<i64, BookingError> {
        let now = Instant::now();
        Ok(self.inner.lock().unwrap().user_held(user, event, now))
    }

    async fn reservation_record_exists(&self, booking: &BookingId) -> Result<bool, BookingError> {
        let now = Instant::now();
        Ok(self.inner.lock().unwrap().record_alive(booking, now))
    }

    async fn queue_join(
        &self,
        event: &EventId,
        user: &UserId,
        joined_at_ms: i64,
    ) -> Result<u64, BookingError> {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.queues.entry(*event).or_default();
        let member = user.to_string();
        let already = queue.iter().any(|(_, m)| *m == member);
        if !already {
            queue.insert((joined_at_ms, member.clone()));
        }
        let position = queue
            .iter()
            .position(|(_, m)| *m == member)
            .map(|p| p as u64 + 1)
            .unwrap_or(0);
        Ok(position)
    }

    async fn queue_position(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<Option<u64>, BookingError> {
        let inner = self.inner.lock().unwrap();
        let member = user.to_string();
        Ok(inner.queues.get(event).and_then(|queue| {
            queue
                .iter()
                .position(|(_, m)| *m == member)
                .map(|p| p as u64 + 1)
        }))
    }

    async fn queue_pop_min(&self, event: &EventId, count: u64) -> Result<Vec<UserId>, BookingError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get_mut(event) else {
            return Ok(Vec::new());
        };
        let mut users = Vec::new();
        for _ in 0..count {
            let Some(head) = queue.iter().next().cloned() else {
                break;
            };
            queue.remove(&head);
            if let Ok(id) = head.1.parse() {
                users.push(id);
            }
        }
        Ok(users)
    }

    async fn queue_len(&self, event: &EventId) -> Result<u64, BookingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(event).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn ticket_save(&self, event: &EventId, ticket: &QueueTicket) -> Result<(), BookingError> {
        self.inner
            .lock()
            .unwrap()
            .tickets
            .insert((*event, ticket.user_id), ticket.clone());
        Ok(())
    }

    async fn ticket_get(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<Option<QueueTicket>, BookingError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tickets
            .get(&(*event, *user))
            .cloned())
    }

    async fn admitted_count(&self, event: &EventId) -> Result<u64, BookingError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .admitted
            .get(event)
            .copied()
            .unwrap_or(0))
    }

    async fn incr_admitted(&self, event: &EventId, by: u64) -> Result<u64, BookingError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.admitted.entry(*event).or_insert(0);
        *count += by;
        Ok(*count)
    }

    async fn clear_queue(&self, event: &EventId) -> Result<(), BookingError> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.remove(event);
        inner.admitted.remove(event);
        inner.tickets.retain(|(e, _), _| e != event);
        Ok(())
    }

    async fn redeem_pass(&self, jti: &str, ttl: Duration) -> Result<bool, BookingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.passes.get(jti) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                inner.passes.insert(jti.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn idem_get(&self, key: &str) -> Result<Option<String>, BookingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.idem.get(key) {
            Some((_, expires)) if *expires <= now => {
                inner.idem.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn idem_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BookingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.idem.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                inner
                    .idem
                    .insert(key.to_string(), (value.to_string(), now + ttl));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    fn reserve_args(zone: ZoneId, user: UserId, event: EventId, qty: i64) -> ReserveArgs {
        ReserveArgs {
            zone,
            user,
            booking: Uuid::new_v4(),
            event,
            show: Uuid::new_v4(),
            quantity: qty,
            max_per_user: 4,
            unit_price: Decimal::new(5000, 2),
            ttl: Duration::from_secs(600),
        }
    }

    fn release_args(r: &ReserveArgs, capacity: i64) -> ReleaseArgs {
        ReleaseArgs {
            zone: r.zone,
            user: r.user,
            booking: r.booking,
            event: r.event,
            quantity: r.quantity,
            capacity,
        }
    }

    #[tokio::test]
    async fn test_rejects_before_zone_init() {
        let store = MemoryStore::new();
        let args = reserve_args(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1);
        let reply = store.reserve(&args).await.unwrap();
        assert_eq!(reply.code, "ZONE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_quantity_checked_first() {
        // Quantity is rejected even when the zone was never initialized.
        let store = MemoryStore::new();
        let args = reserve_args(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 0);
        let reply = store.reserve(&args).await.unwrap();
        assert_eq!(reply.code, "INVALID_QUANTITY");
    }

    #[tokio::test]
    async fn test_decrement_and_insufficient_stock() {
        let store = MemoryStore::new();
        let (zone, event) = (Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 3).await.unwrap();

        let first = reserve_args(zone, Uuid::new_v4(), event, 2);
        assert_eq!(store.reserve(&first).await.unwrap(), ScriptReply::ok(1));

        let second = reserve_args(zone, Uuid::new_v4(), event, 2);
        let reply = store.reserve(&second).await.unwrap();
        assert_eq!(reply.code, "INSUFFICIENT_STOCK");
        assert_eq!(reply.detail, 1);
        assert_eq!(store.zone_available(&zone).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_per_user_cap() {
        let store = MemoryStore::new();
        let (zone, user, event) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 100).await.unwrap();

        for _ in 0..4 {
            let args = reserve_args(zone, user, event, 1);
            assert!(store.reserve(&args).await.unwrap().ok);
        }
        let fifth = reserve_args(zone, user, event, 1);
        let reply = store.reserve(&fifth).await.unwrap();
        assert_eq!(reply.code, "USER_LIMIT_EXCEEDED");
        assert_eq!(reply.detail, 4);
        assert_eq!(store.zone_available(&zone).await.unwrap(), Some(96));
    }

    #[tokio::test]
    async fn test_release_restores_and_is_one_shot() {
        let store = MemoryStore::new();
        let (zone, user, event) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 10).await.unwrap();

        let args = reserve_args(zone, user, event, 2);
        assert!(store.reserve(&args).await.unwrap().ok);
        assert_eq!(store.user_reserved_count(&user, &event).await.unwrap(), 2);

        let rel = release_args(&args, 10);
        assert_eq!(store.release(&rel).await.unwrap(), ScriptReply::ok(10));
        assert_eq!(store.user_reserved_count(&user, &event).await.unwrap(), 0);
        assert!(!store.reservation_record_exists(&args.booking).await.unwrap());

        // Second release is a no-op.
        let reply = store.release(&rel).await.unwrap();
        assert_eq!(reply.code, "ALREADY_RELEASED");
        assert_eq!(store.zone_available(&zone).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_release_never_exceeds_capacity() {
        let store = MemoryStore::new();
        let (zone, user, event) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 10).await.unwrap();

        let args = reserve_args(zone, user, event, 2);
        assert!(store.reserve(&args).await.unwrap().ok);

        // Capacity below current+qty clamps the restore.
        let mut rel = release_args(&args, 10);
        rel.quantity = 5; // mismatched inverse must still respect capacity
        assert_eq!(store.release(&rel).await.unwrap().detail, 10);
    }

    #[tokio::test]
    async fn test_ttl_expires_user_counter_and_record() {
        let store = MemoryStore::new();
        let (zone, user, event) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 10).await.unwrap();

        let mut args = reserve_args(zone, user, event, 2);
        args.ttl = Duration::from_millis(30);
        assert!(store.reserve(&args).await.unwrap().ok);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.user_reserved_count(&user, &event).await.unwrap(), 0);
        assert!(!store.reservation_record_exists(&args.booking).await.unwrap());
        // Availability does NOT come back by itself; that is the reaper's job.
        assert_eq!(store.zone_available(&zone).await.unwrap(), Some(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_no_oversell_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let (zone, event) = (Uuid::new_v4(), Uuid::new_v4());
        store.init_zone(&zone, 10).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let args = reserve_args(zone, Uuid::new_v4(), event, 1);
                store.reserve(&args).await.unwrap()
            }));
        }

        let mut ok = 0;
        let mut sold_out = 0;
        for handle in handles {
            let reply = handle.await.unwrap();
            if reply.ok {
                ok += 1;
            } else {
                assert_eq!(reply.code, "INSUFFICIENT_STOCK");
                sold_out += 1;
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(sold_out, 90);
        assert_eq!(store.zone_available(&zone).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_queue_fifo_with_tie_break() {
        let store = MemoryStore::new();
        let event = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.queue_join(&event, &a, 100).await.unwrap();
        store.queue_join(&event, &b, 50).await.unwrap();
        store.queue_join(&event, &c, 100).await.unwrap();

        // b joined earliest; a and c tie on time and order by user id.
        assert_eq!(store.queue_position(&event, &b).await.unwrap(), Some(1));
        let popped = store.queue_pop_min(&event, 3).await.unwrap();
        assert_eq!(popped[0], b);
        let expected_second = if a.to_string() < c.to_string() { a } else { c };
        assert_eq!(popped[1], expected_second);
    }

    #[tokio::test]
    async fn test_queue_join_idempotent() {
        let store = MemoryStore::new();
        let event = Uuid::new_v4();
        let user = Uuid::new_v4();
        let p1 = store.queue_join(&event, &user, 10).await.unwrap();
        let p2 = store.queue_join(&event, &user, 99).await.unwrap();
        assert_eq!(p1, p2);
        assert_eq!(store.queue_len(&event).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pass_redeem_one_shot() {
        let store = MemoryStore::new();
        assert!(store.redeem_pass("jti-1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.redeem_pass("jti-1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_idem_window() {
        let store = MemoryStore::new();
        assert!(store.idem_put("k", "v1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.idem_put("k", "v2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.idem_get("k").await.unwrap().as_deref(), Some("v1"));
    }
}
