//! Wire shapes for the relay.
//!
//! Inbound application messages are free-form JSON objects that must carry a
//! `target` client id. The relay forwards them verbatim with a `from` field
//! stamped by the server. The only message the relay originates itself is the
//! membership list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{RelayError, RelayResult};
use crate::types::ClientId;

/// Serialized text frame queued for a connection
pub type Outbound = Arc<str>;

const TARGET_FIELD: &str = "target";
const FROM_FIELD: &str = "from";

/// Messages originated by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current membership, sent to everyone whenever it changes
    Users { data: Vec<ClientId> },
}

impl ServerMessage {
    pub fn to_outbound(&self) -> RelayResult<Outbound> {
        serde_json::to_string(self)
            .map(Outbound::from)
            .map_err(|e| RelayError::Encode(e.to_string()))
    }
}

/// A decoded application message addressed to another client
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub target: ClientId,
    fields: Map<String, Value>,
}

impl InboundMessage {
    /// Decode a raw text frame.
    ///
    /// A `target` that is absent, `null`, empty or not a string is treated as
    /// missing.
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(fields) = value else {
            return Err(RelayError::NotAnObject);
        };

        let target = match fields.get(TARGET_FIELD) {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            _ => return Err(RelayError::MissingTarget),
        };

        Ok(Self { target, fields })
    }

    /// Stamp the sender and serialize for delivery.
    ///
    /// Any `from` the client put in the message is overwritten.
    pub fn into_routed(mut self, sender: &str) -> RelayResult<Outbound> {
        self.fields
            .insert(FROM_FIELD.to_string(), Value::String(sender.to_string()));
        serde_json::to_string(&self.fields)
            .map(Outbound::from)
            .map_err(|e| RelayError::Encode(e.to_string()))
    }
}
