// Fixed-window rate limiting backed by Redis, keyed by client IP.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use redis::AsyncCommands;
use std::net::SocketAddr;

use crate::api::AppState;
use crate::error::ErrorResponse;

/// Check rate limit for a given key.
/// Returns (allowed, remaining, reset_time_seconds).
pub async fn check_rate_limit(
    redis_conn: &mut redis::aio::ConnectionManager,
    key: &str,
    max_requests: u32,
    window_seconds: u64,
) -> Result<(bool, u32, u64), redis::RedisError> {
    let cache_key = format!("ratelimit:{}", key);

    let current: u32 = redis_conn.get(&cache_key).await.unwrap_or(0);

    if current >= max_requests {
        let ttl: i64 = redis_conn.ttl(&cache_key).await.unwrap_or(0);
        return Ok((false, 0, ttl.max(0) as u64));
    }

    let new_count: u32 = redis_conn.incr(&cache_key, 1).await?;

    // Set expiry on first request of the window.
    if new_count == 1 {
        let _: () = redis_conn.expire(&cache_key, window_seconds as i64).await?;
    }

    let ttl: i64 = redis_conn
        .ttl(&cache_key)
        .await
        .unwrap_or(window_seconds as i64);
    let remaining = max_requests.saturating_sub(new_count);

    Ok((true, remaining, ttl.max(0) as u64))
}

/// Client identifier for the rate limit key: X-Forwarded-For when present
/// (first hop), otherwise the socket peer address.
pub fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    let mut conn = state.redis.clone();
    let window_seconds = (state.config.rate_limit_window_ms / 1_000).max(1);

    match check_rate_limit(&mut conn, &format!("ip:{}", ip), state.config.rate_limit_max, window_seconds).await {
        Ok((true, _, _)) => next.run(req).await,
        Ok((false, _, reset)) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(
                ErrorResponse::new("Rate limit exceeded", "RATE_LIMITED").with_retry_after(reset),
            ),
        )
            .into_response(),
        Err(e) => {
            // Redis being down must not take the API with it.
            tracing::warn!("Rate limit check failed, allowing request: {}", e);
            next.run(req).await
        }
    }
}
