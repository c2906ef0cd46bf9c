//! Membership registry
//!
//! The registry is the single owner of "who is connected". All mutations and
//! every broadcast snapshot go through its lock, so each reader sees the
//! registrations as one serial sequence.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::connection::ConnectionHandle;
use crate::error::{RelayError, RelayResult};
use crate::protocol::Outbound;
use crate::types::{ClientId, ConnectionId};

/// What happens when a client id that is already registered connects again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacePolicy {
    /// The new connection takes over the id; the old handle is orphaned
    #[default]
    LastWriterWins,
    /// The new connection is refused while the id is taken
    RejectDuplicate,
}

impl FromStr for ReplacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "last-writer-wins" | "replace" => Ok(Self::LastWriterWins),
            "reject-duplicate" | "reject" => Ok(Self::RejectDuplicate),
            other => Err(format!("Unknown replace policy: {}", other)),
        }
    }
}

/// Result of [`Registry::register`]
#[derive(Debug)]
pub enum Registration {
    Inserted,
    /// The previous handle for the id, now detached from the registry
    Replaced(ConnectionHandle),
    Rejected,
}

/// Summary of one fan-out
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<ClientId>,
}

/// Row for the HTTP membership listing
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
}

pub struct Registry {
    clients: RwLock<BTreeMap<ClientId, ConnectionHandle>>,
    /// Held for the whole of a broadcast so recipients see broadcasts in
    /// snapshot order
    broadcast_gate: Mutex<()>,
    policy: ReplacePolicy,
    send_timeout: Duration,
}

impl Registry {
    pub fn new(policy: ReplacePolicy, send_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            broadcast_gate: Mutex::new(()),
            policy,
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Insert or replace the entry for `id` according to the replace policy.
    ///
    /// A replaced handle is returned untouched; closing it is up to the
    /// session that owns it.
    pub async fn register(&self, id: ClientId, handle: ConnectionHandle) -> Registration {
        debug_assert!(!id.is_empty(), "client id must be non-empty");
        let mut clients = self.clients.write().await;

        if self.policy == ReplacePolicy::RejectDuplicate && clients.contains_key(&id) {
            tracing::debug!("Rejected duplicate registration for {}", id);
            return Registration::Rejected;
        }

        match clients.insert(id.clone(), handle) {
            Some(old) => {
                tracing::debug!("Replaced registration for {} (old connection {})", id, old.id());
                Registration::Replaced(old)
            }
            None => {
                tracing::debug!("Registered {}", id);
                Registration::Inserted
            }
        }
    }

    /// Remove the entry for `id`. Absent ids are a no-op.
    pub async fn unregister(&self, id: &str) -> Option<ConnectionHandle> {
        let removed = self.clients.write().await.remove(id);
        if removed.is_some() {
            tracing::debug!("Unregistered {}", id);
        }
        removed
    }

    /// Remove the entry for `id` only if it still belongs to `connection`.
    ///
    /// Returns whether an entry was removed. A session that was replaced by a
    /// newer connection gets `false` and leaves the replacement in place.
    pub async fn unregister_connection(&self, id: &str, connection: &ConnectionId) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(id) {
            Some(handle) if handle.id() == connection => {
                clients.remove(id);
                tracing::debug!("Unregistered {} (connection {})", id, connection);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<ConnectionHandle> {
        self.clients.read().await.get(id).cloned()
    }

    /// All registered ids, in ascending order
    pub async fn snapshot(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(id, handle)| ClientInfo {
                id: id.clone(),
                connected_at: handle.connected_at(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Deliver a frame to one registered client.
    ///
    /// On a failed send the recipient's handle is closed so its own session
    /// runs the disconnect path.
    pub async fn send_to(&self, id: &str, frame: Outbound) -> RelayResult<()> {
        let handle = self
            .lookup(id)
            .await
            .ok_or_else(|| RelayError::RecipientNotFound(id.to_string()))?;

        if let Err(e) = handle.send(frame, self.send_timeout).await {
            tracing::warn!("Send to {} failed: {}", id, e);
            handle.close();
            return Err(e);
        }
        Ok(())
    }

    /// Deliver the same frame to every registered client
    pub async fn for_each_send(&self, frame: Outbound) -> BroadcastReport {
        self.broadcast_with(|_| Ok(frame)).await
    }

    /// Build a frame from the current membership and deliver it to every member.
    ///
    /// The ids passed to `build` and the recipient set come from the same read
    /// of the map. Broadcasts are serialized against each other.
    pub async fn broadcast_with<F>(&self, build: F) -> BroadcastReport
    where
        F: FnOnce(&[ClientId]) -> RelayResult<Outbound>,
    {
        let _gate = self.broadcast_gate.lock().await;

        let (ids, handles): (Vec<ClientId>, Vec<ConnectionHandle>) = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .unzip()
        };

        let frame = match build(&ids) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to build broadcast: {}", e);
                return BroadcastReport::default();
            }
        };

        let timeout = self.send_timeout;
        let sends = ids.into_iter().zip(handles).map(|(id, handle)| {
            let frame = frame.clone();
            async move {
                let result = handle.send(frame, timeout).await;
                (id, handle, result)
            }
        });

        let mut report = BroadcastReport::default();
        for (id, handle, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!("Broadcast to {} failed: {}", id, e);
                    handle.close();
                    report.failed.push(id);
                }
            }
        }

        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ReplacePolicy::default(), Duration::from_secs(2))
    }
}
