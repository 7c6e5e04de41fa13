//! Per-IP admission limiter
//!
//! Token bucket per client IP, held in process memory: refill at the
//! configured rate, capacity bounded by the burst size. Over-limit
//! requests get 429 with Retry-After and never reach a handler.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::sync::Arc;

use crate::errors::BookingError;

use super::state::AppState;
use super::types::error_response;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    /// Refill rate, tokens per second
    rps: f64,
    /// Bucket capacity
    burst: f64,
}

impl RateLimiter {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rps: f64::from(rps.max(1)),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Take one token for `ip`. Err carries the suggested Retry-After.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.rps;
            Err(wait.ceil().max(1.0) as u64)
        }
    }
}

/// Client address: trust X-Forwarded-For only in so far as the gateway is
/// the sole ingress behind a terminating proxy; fall back to the socket.
fn client_ip(request: &Request<Body>) -> IpAddr {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && let Ok(ip) = first.trim().parse()
    {
        return ip;
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    match state.limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            tracing::debug!(ip = %ip, retry_after_secs, "Rate limited");
            error_response(&BookingError::TooManyRequests { retry_after_secs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new(10, 3);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        let retry = limiter.check(ip).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn test_ips_have_independent_buckets() {
        let limiter = RateLimiter::new(10, 1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok());
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::new(1000, 1);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();

        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_err());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.check(ip).is_ok());
    }
}
