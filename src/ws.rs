use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::StreamExt;
use std::sync::Arc;

use crate::session::run_session;
use crate::state::AppState;
use crate::types::{validate_client_id, ClientId};

/// WebSocket upgrade handler for `/ws/{client_id}`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<ClientId>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(e) = validate_client_id(&client_id, state.max_client_id_len) {
        tracing::warn!("Refusing WebSocket connection: {}", e);
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    tracing::info!("WebSocket connection request: client_id={}", client_id);

    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(socket: WebSocket, client_id: ClientId, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    run_session(client_id, sender, receiver, state).await;
}
