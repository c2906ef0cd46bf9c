//! Connect-attempt rate limiting
//!
//! A reconnect replaces the live registration for a client id, so a client
//! stuck in a reconnect loop churns membership for everyone. Upgrade requests
//! on `/ws/{client_id}` are limited per client id.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::types::ClientId;

const MIN_CLEANUP_PERIOD: Duration = Duration::from_millis(100);

/// Fixed-window counter keyed by an arbitrary string
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Map of key to (request count, window start)
    requests: Arc<RwLock<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(10))
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if the request is allowed
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        match requests.get_mut(key) {
            Some((count, window_start)) => {
                if now.duration_since(*window_start) >= self.window {
                    *count = 1;
                    *window_start = now;
                    true
                } else if *count >= self.max_requests {
                    false
                } else {
                    *count += 1;
                    true
                }
            }
            None => {
                requests.insert(key.to_string(), (1, now));
                true
            }
        }
    }

    /// Drop entries whose window is long over
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
    }

    /// Periodically run [`cleanup`](Self::cleanup) in the background
    pub fn spawn_cleanup(&self) {
        let limiter = self.clone();
        // interval() panics on a zero period
        let period = (self.window * 2).max(MIN_CLEANUP_PERIOD);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiter.cleanup().await;
            }
        });
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.requests.read().await.len()
    }
}

fn rate_limited(retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (header::RETRY_AFTER, retry_after.as_secs().max(1).to_string()),
        ],
        "Too many connection attempts. Please slow down.",
    )
        .into_response()
}

/// Middleware limiting WebSocket connect attempts per client id.
///
/// Keys on the decoded path parameter, the same id the upgrade handler
/// registers, so `/ws/%61lice` and `/ws/alice` share one budget. Must be
/// installed with `route_layer` so the path parameters are available.
pub async fn connect_rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    Path(client_id): Path<ClientId>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if !limiter.check(&client_id).await {
        tracing::warn!(client_id = %client_id, "Connect attempt rate limited");
        return rate_limited(limiter.window());
    }

    next.run(request).await
}
