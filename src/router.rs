//! Directed message routing and membership broadcasts
//!
//! Routing failures are never reported back to the sender. They end up in the
//! log and in the returned [`RouteOutcome`].

use std::sync::Arc;

use crate::error::RelayError;
use crate::protocol::{InboundMessage, ServerMessage};
use crate::registry::{BroadcastReport, Registry};
use crate::types::ClientId;

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Delivered { target: ClientId },
    Malformed,
    MissingTarget,
    RecipientNotFound { target: ClientId },
    SendFailed { target: ClientId },
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Forward one raw message from `sender` to the client named in its `target`
    pub async fn route(&self, sender: &str, raw: &str) -> RouteOutcome {
        let message = match InboundMessage::parse(raw) {
            Ok(m) => m,
            Err(RelayError::MissingTarget) => {
                tracing::warn!("Message from {} has no target", sender);
                return RouteOutcome::MissingTarget;
            }
            Err(e) => {
                tracing::warn!("Failed to decode message from {}: {}", sender, e);
                return RouteOutcome::Malformed;
            }
        };

        let target = message.target.clone();
        let frame = match message.into_routed(sender) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode message from {}: {}", sender, e);
                return RouteOutcome::Malformed;
            }
        };

        match self.registry.send_to(&target, frame).await {
            Ok(()) => {
                tracing::debug!("Routed message {} -> {}", sender, target);
                RouteOutcome::Delivered { target }
            }
            Err(RelayError::RecipientNotFound(_)) => {
                tracing::warn!("Recipient {} not found (from {})", target, sender);
                RouteOutcome::RecipientNotFound { target }
            }
            Err(e) => {
                tracing::warn!("Dropped message {} -> {}: {}", sender, target, e);
                RouteOutcome::SendFailed { target }
            }
        }
    }

    /// Send the current membership list to every registered client
    pub async fn broadcast_membership(&self) -> BroadcastReport {
        self.registry
            .broadcast_with(|ids| {
                ServerMessage::Users {
                    data: ids.to_vec(),
                }
                .to_outbound()
            })
            .await
    }
}
