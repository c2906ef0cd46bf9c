//! Per-client session loop
//!
//! A session moves strictly forward through
//! `Connecting -> Registered -> Closing -> Closed`. While registered it reads
//! frames one at a time and hands them to the router; a bad message is logged
//! and skipped, only the transport ending (or a close request on the
//! connection handle) ends the loop.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::protocol::Outbound;
use crate::registry::Registration;
use crate::state::AppState;
use crate::types::ClientId;

/// Close reason sent to a connection refused under `RejectDuplicate`
pub const DUPLICATE_ID_REASON: &str = "client id already connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Registered,
    Closing,
    Closed,
}

/// Run a session for `client_id` over an already-accepted connection.
///
/// Returns once the session has fully closed and its registration (if it
/// still owned one) has been removed and announced.
pub async fn run_session<S, R, E>(
    client_id: ClientId,
    sink: S,
    stream: R,
    state: Arc<AppState>,
) -> SessionState
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    Session::new(client_id, state).run(sink, stream).await
}

struct Session {
    client_id: ClientId,
    state: SessionState,
    app: Arc<AppState>,
}

impl Session {
    fn new(client_id: ClientId, app: Arc<AppState>) -> Self {
        Self {
            client_id,
            state: SessionState::Connecting,
            app,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session state cannot move backwards");
        tracing::debug!(
            client_id = %self.client_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    async fn run<S, R, E>(mut self, mut sink: S, mut stream: R) -> SessionState
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        // Frames queued before the writer starts wait in the channel
        let (handle, outbound_rx) = ConnectionHandle::channel(self.app.outbound_buffer);

        match self
            .app
            .registry
            .register(self.client_id.clone(), handle.clone())
            .await
        {
            Registration::Inserted => {
                tracing::info!("Client {} connected ({})", self.client_id, handle.id());
            }
            Registration::Replaced(old) => {
                tracing::info!(
                    "Client {} reconnected ({}), replacing connection {}",
                    self.client_id,
                    handle.id(),
                    old.id()
                );
            }
            Registration::Rejected => {
                tracing::warn!(
                    "Client {} rejected: id is already connected",
                    self.client_id
                );
                self.refuse(&mut sink).await;
                self.transition(SessionState::Closed);
                return self.state;
            }
        }

        let mut writer = tokio::spawn(write_outbound(sink, outbound_rx, self.client_id.clone()));

        self.transition(SessionState::Registered);
        self.app.router.broadcast_membership().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("Received message from {}: {}", self.client_id, text.as_str());
                        self.app.router.route(&self.client_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::warn!(
                            "Ignoring {}-byte binary frame from {}",
                            data.len(),
                            self.client_id
                        );
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Client {} closed the connection", self.client_id);
                        break;
                    }
                    // Pings are answered by the websocket layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for {}: {}", self.client_id, e);
                        break;
                    }
                    None => break,
                },
                _ = handle.closed() => {
                    tracing::warn!("Closing {}: connection stopped accepting messages", self.client_id);
                    break;
                }
                _ = &mut writer => {
                    tracing::info!("Outbound stream for {} ended", self.client_id);
                    break;
                }
            }
        }

        self.transition(SessionState::Closing);
        if self
            .app
            .registry
            .unregister_connection(&self.client_id, handle.id())
            .await
        {
            self.app.router.broadcast_membership().await;
        } else {
            tracing::debug!(
                "Client {} was replaced by a newer connection, registration left in place",
                self.client_id
            );
        }

        drop(handle);
        writer.abort();

        self.transition(SessionState::Closed);
        tracing::info!("Client {} disconnected", self.client_id);
        self.state
    }

    /// Tell a refused client why before dropping the connection
    async fn refuse<S>(&self, sink: &mut S)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(DUPLICATE_ID_REASON),
        }));
        let refusal = async {
            sink.send(frame).await?;
            sink.close().await
        };
        match tokio::time::timeout(self.app.registry.send_timeout(), refusal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to send close to {}: {}", self.client_id, e),
            Err(_) => tracing::warn!("Timed out sending close to {}", self.client_id),
        }
    }
}

/// Drain a connection's outbound queue into its socket
async fn write_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>, client_id: ClientId)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
            tracing::warn!("Failed to write to {}: {}", client_id, e);
            return;
        }
    }
    let _ = sink.close().await;
}
