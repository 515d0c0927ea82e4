//! In-process rate limiting built on `governor`.
//!
//! State lives in this process only; limits are per instance, not global
//! across a multi-instance deployment.

use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{keyed::DashMapStateStore, InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter for global/unkeyed use (e.g. outbound calls to one vendor).
pub type UnkeyedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limiter keyed by client IP address.
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

/// Build a quota allowing `attempts` requests per `window_seconds`, with the
/// whole allowance usable as a burst.
fn quota(attempts: u32, window_seconds: u64) -> Quota {
    let attempts = NonZeroU32::new(attempts.max(1)).unwrap_or(NonZeroU32::MIN);
    let period_ms = ((window_seconds.max(1) * 1000) / attempts.get() as u64).max(1);
    Quota::with_period(Duration::from_millis(period_ms))
        .unwrap_or_else(|| Quota::per_second(attempts))
        .allow_burst(attempts)
}

pub fn create_unkeyed_rate_limiter(attempts: u32, window_seconds: u64) -> UnkeyedRateLimiter {
    Arc::new(RateLimiter::direct(quota(attempts, window_seconds)))
}

pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(quota(attempts, window_seconds)))
}

/// Seconds until an unkeyed limiter admits the next call, or `None` when a
/// call is allowed right now (and has been counted).
pub fn check_unkeyed(limiter: &UnkeyedRateLimiter) -> Option<Duration> {
    limiter
        .check()
        .err()
        .map(|negative| negative.wait_time_from(DefaultClock::default().now()))
}

fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded_ip.or_else(|| {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| addr.ip())
    })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                tracing::warn!(ip = %ip, "Rate limit exceeded");
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs().max(1)),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}
