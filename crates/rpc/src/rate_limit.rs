//! Fixed-window per-IP rate limiting for the RPC endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::json;

use crate::RpcState;
use crate::error::ErrorCode;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per client IP over a fixed window. `max_requests = 0`
/// disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    hits: DashMap<IpAddr, Window>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            hits: DashMap::new(),
        }
    }

    /// Record a hit; returns whether the request is allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let mut entry = self.hits.entry(ip).or_insert_with(|| Window {
            started: Instant::now(),
            count: 0,
        });
        if entry.started.elapsed() >= self.window {
            entry.started = Instant::now();
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.max_requests
    }
}

pub(crate) async fn rate_limit_layer(
    State(state): State<RpcState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip());

    if !state.rate_limiter.check(ip) {
        state.metrics.rate_limited_total.increment(1);
        let body = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": ErrorCode::RateLimited.code(),
                "message": "rate limit exceeded, retry later",
            },
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    next.run(request).await
}
