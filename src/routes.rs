use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ratelimit::{connect_rate_limit_middleware, RateLimiter};
use crate::{api, state::AppState, ws};

/// Build the HTTP application
pub fn app(state: Arc<AppState>, rate_limiter: Option<RateLimiter>) -> Router {
    let mut ws_routes = Router::new().route("/ws/{client_id}", get(ws::ws_handler));

    // WebSocket route with connect-attempt limiting
    if let Some(limiter) = rate_limiter {
        limiter.spawn_cleanup();
        ws_routes = ws_routes.route_layer(middleware::from_fn_with_state(
            Arc::new(limiter),
            connect_rate_limit_middleware,
        ));
    }

    Router::new()
        .route("/", get(api::health))
        .route("/api/clients", get(api::list_clients))
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
