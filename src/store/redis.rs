//! Redis fast store
//!
//! The reserve and release scripts run server-side in Redis's
//! single-threaded command order; no interleaving is possible between the
//! check and the decrement. Every rejection returns in one round trip
//! without loading anything from PostgreSQL, which is what makes sold-out
//! thundering herds cheap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Semaphore;

use crate::core_types::{BookingId, EventId, UserId, ZoneId};
use crate::errors::BookingError;

use super::{
    FastStore, QueueTicket, RELEASE_MARKER_TTL_SECS, ReleaseArgs, ReserveArgs, ScriptReply,
    TicketStatus, keys,
};

/// Atomic check + decrement + record. Ordering of the checks matters for
/// clear errors: quantity, zone existence, user limit, stock.
static RESERVE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
-- KEYS[1] = zone availability counter
-- KEYS[2] = per-user reservation counter
-- KEYS[3] = reservation record hash
-- ARGV = qty, max_per_user, user, booking, zone, event, show, unit_price, ttl_secs
local qty = tonumber(ARGV[1])
if qty == nil or qty <= 0 then
  return {0, 'INVALID_QUANTITY', 0}
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {0, 'ZONE_NOT_FOUND', 0}
end
local held = tonumber(redis.call('GET', KEYS[2]) or '0')
if held + qty > tonumber(ARGV[2]) then
  return {0, 'USER_LIMIT_EXCEEDED', held}
end
local avail = tonumber(redis.call('GET', KEYS[1]))
if avail < qty then
  return {0, 'INSUFFICIENT_STOCK', avail}
end
local remaining = redis.call('DECRBY', KEYS[1], qty)
redis.call('INCRBY', KEYS[2], qty)
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[9]))
redis.call('HSET', KEYS[3],
  'booking', ARGV[4], 'user', ARGV[3], 'zone', ARGV[5],
  'event', ARGV[6], 'show', ARGV[7], 'quantity', ARGV[1],
  'unit_price', ARGV[8], 'status', 'RESERVED')
redis.call('EXPIRE', KEYS[3], tonumber(ARGV[9]))
return {1, 'OK', remaining}
"#,
    )
});

/// Inverse of the reserve script. The NX marker makes it one-shot per
/// booking: a reaper/compensation double call changes nothing.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
-- KEYS[1] = zone availability counter
-- KEYS[2] = per-user reservation counter
-- KEYS[3] = reservation record hash
-- KEYS[4] = one-shot release marker
-- ARGV = qty, capacity, marker_ttl_secs
if redis.call('SET', KEYS[4], '1', 'NX', 'EX', tonumber(ARGV[3])) == false then
  return {0, 'ALREADY_RELEASED', 0}
end
local qty = tonumber(ARGV[1])
local avail = redis.call('INCRBY', KEYS[1], qty)
local cap = tonumber(ARGV[2])
if avail > cap then
  redis.call('SET', KEYS[1], cap)
  avail = cap
end
local held = tonumber(redis.call('GET', KEYS[2]) or '0') - qty
if held > 0 then
  redis.call('SET', KEYS[2], held, 'KEEPTTL')
else
  redis.call('DEL', KEYS[2])
end
redis.call('DEL', KEYS[3])
return {1, 'OK', avail}
"#,
    )
});

/// Production fast store over a multiplexed Redis connection.
pub struct RedisStore {
    manager: ConnectionManager,
    /// Caps in-flight store commands (FAST_STORE_POOL_SIZE).
    permits: Arc<Semaphore>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, pool_size: u32) -> Result<Self, BookingError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BookingError::ServiceUnavailable(format!("redis url: {e}")))?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!("Fast store connection established");
        Ok(Self {
            manager,
            permits: Arc::new(Semaphore::new(pool_size.max(1) as usize)),
        })
    }

    async fn conn(&self) -> (tokio::sync::OwnedSemaphorePermit, ConnectionManager) {
        // Semaphore is never closed, acquire cannot fail.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("fast store semaphore closed");
        (permit, self.manager.clone())
    }
}

#[async_trait]
impl FastStore for RedisStore {
    async fn init_zone(&self, zone: &ZoneId, available: i64) -> Result<bool, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let written: bool = conn.set_nx(keys::zone_availability(zone), available).await?;
        Ok(written)
    }

    async fn zone_available(&self, zone: &ZoneId) -> Result<Option<i64>, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let v: Option<i64> = conn.get(keys::zone_availability(zone)).await?;
        Ok(v)
    }

    async fn reserve(&self, args: &ReserveArgs) -> Result<ScriptReply, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let (ok, code, detail): (i64, String, i64) = RESERVE_SCRIPT
            .key(keys::zone_availability(&args.zone))
            .key(keys::user_reservations(&args.user, &args.event))
            .key(keys::reservation(&args.booking))
            .arg(args.quantity)
            .arg(args.max_per_user)
            .arg(args.user.to_string())
            .arg(args.booking.to_string())
            .arg(args.zone.to_string())
            .arg(args.event.to_string())
            .arg(args.show.to_string())
            .arg(args.unit_price.to_string())
            .arg(args.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(ScriptReply {
            ok: ok == 1,
            code,
            detail,
        })
    }

    async fn release(&self, args: &ReleaseArgs) -> Result<ScriptReply, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let (ok, code, detail): (i64, String, i64) = RELEASE_SCRIPT
            .key(keys::zone_availability(&args.zone))
            .key(keys::user_reservations(&args.user, &args.event))
            .key(keys::reservation(&args.booking))
            .key(keys::release_marker(&args.booking))
            .arg(args.quantity)
            .arg(args.capacity)
            .arg(RELEASE_MARKER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(ScriptReply {
            ok: ok == 1,
            code,
            detail,
        })
    }

    async fn user_reserved_count(
        &self,
        user: &UserId,
        event: &EventId,
    ) -> Result<i64, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let v: Option<i64> = conn.get(keys::user_reservations(user, event)).await?;
        Ok(v.unwrap_or(0))
    }

    async fn reservation_record_exists(&self, booking: &BookingId) -> Result<bool, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let exists: bool = conn.exists(keys::reservation(booking)).await?;
        Ok(exists)
    }

    async fn queue_join(
        &self,
        event: &EventId,
        user: &UserId,
        joined_at_ms: i64,
    ) -> Result<u64, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let key = keys::queue(event);
        // NX keeps the original joined_at on duplicate joins.
        let _: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg("NX")
            .arg(joined_at_ms)
            .arg(user.to_string())
            .query_async(&mut conn)
            .await?;
        let rank: Option<i64> = conn.zrank(&key, user.to_string()).await?;
        Ok(rank.map(|r| r as u64 + 1).unwrap_or(0))
    }

    async fn queue_position(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<Option<u64>, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let rank: Option<i64> = conn.zrank(keys::queue(event), user.to_string()).await?;
        Ok(rank.map(|r| r as u64 + 1))
    }

    async fn queue_pop_min(&self, event: &EventId, count: u64) -> Result<Vec<UserId>, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let popped: Vec<(String, f64)> = conn.zpopmin(keys::queue(event), count as isize).await?;
        let mut users = Vec::with_capacity(popped.len());
        for (member, _score) in popped {
            match member.parse::<uuid::Uuid>() {
                Ok(id) => users.push(id),
                Err(_) => tracing::warn!(member = %member, "Dropping malformed queue member"),
            }
        }
        Ok(users)
    }

    async fn queue_len(&self, event: &EventId) -> Result<u64, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let len: u64 = conn.zcard(keys::queue(event)).await?;
        Ok(len)
    }

    async fn ticket_save(&self, event: &EventId, ticket: &QueueTicket) -> Result<(), BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let key = keys::queue_ticket(event, &ticket.user_id);
        let mut fields = vec![
            ("status".to_string(), ticket.status.as_str().to_string()),
            ("joined_at_ms".to_string(), ticket.joined_at_ms.to_string()),
        ];
        if let Some(pass) = &ticket.pass {
            fields.push(("pass".to_string(), pass.clone()));
        }
        let _: () = conn.hset_multiple(&key, &fields).await?;
        // Tickets self-clean a day after the sale.
        let _: bool = conn.expire(&key, RELEASE_MARKER_TTL_SECS as i64).await?;
        Ok(())
    }

    async fn ticket_get(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<Option<QueueTicket>, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let map: HashMap<String, String> = conn.hgetall(keys::queue_ticket(event, user)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let status = map
            .get("status")
            .and_then(|s| TicketStatus::from_str(s))
            .unwrap_or(TicketStatus::Waiting);
        let joined_at_ms = map
            .get("joined_at_ms")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(Some(QueueTicket {
            user_id: *user,
            status,
            joined_at_ms,
            pass: map.get("pass").cloned(),
        }))
    }

    async fn admitted_count(&self, event: &EventId) -> Result<u64, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let v: Option<u64> = conn.get(keys::queue_admitted(event)).await?;
        Ok(v.unwrap_or(0))
    }

    async fn incr_admitted(&self, event: &EventId, by: u64) -> Result<u64, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let v: u64 = conn.incr(keys::queue_admitted(event), by).await?;
        Ok(v)
    }

    async fn clear_queue(&self, event: &EventId) -> Result<(), BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let _: () = conn
            .del(&[keys::queue(event), keys::queue_admitted(event)])
            .await?;
        Ok(())
    }

    async fn redeem_pass(&self, jti: &str, ttl: Duration) -> Result<bool, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let set: Option<String> = redis::cmd("SET")
            .arg(keys::queue_pass(jti))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn idem_get(&self, key: &str) -> Result<Option<String>, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let v: Option<String> = conn.get(keys::idempotency(key)).await?;
        Ok(v)
    }

    async fn idem_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BookingError> {
        let (_permit, mut conn) = self.conn().await;
        let set: Option<String> = redis::cmd("SET")
            .arg(keys::idempotency(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}
