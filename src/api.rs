//! HTTP endpoints next to the WebSocket relay.
//!
//! A health check for load balancers and a read-only view of current
//! membership.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::registry::ClientInfo;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub message: String,
    pub clients: usize,
}

/// GET /
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "WebRTC Signaling Server is running".to_string(),
        clients: state.registry.len().await,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientsResponse {
    pub clients: Vec<ClientInfo>,
}

/// GET /api/clients
pub async fn list_clients(State(state): State<Arc<AppState>>) -> Json<ClientsResponse> {
    Json(ClientsResponse {
        clients: state.registry.clients().await,
    })
}
