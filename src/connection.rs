//! Per-connection handle shared between a session and the registry.
//!
//! Every outbound frame for a connection goes through one bounded queue that a
//! single writer task drains into the socket, so directed and broadcast frames
//! never interleave and per-sender order is preserved.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::error::{RelayError, RelayResult};
use crate::protocol::Outbound;
use crate::types::ConnectionId;

#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    close_signal: Arc<Notify>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Create a handle together with the receiving end of its outbound queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            tx,
            close_signal: Arc::new(Notify::new()),
            connected_at: Utc::now(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a frame, waiting at most `timeout` for space
    pub async fn send(&self, frame: Outbound, timeout: Duration) -> RelayResult<()> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => Err(RelayError::SendTimeout(timeout)),
        }
    }

    /// Ask the owning session to shut down.
    ///
    /// The request is remembered if the session is not currently waiting.
    pub fn close(&self) {
        self.close_signal.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.close_signal.notified().await;
    }

    pub fn is_same_connection(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("queue_closed", &self.tx.is_closed())
            .finish()
    }
}
