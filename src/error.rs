use std::time::Duration;

use crate::types::ClientId;

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while decoding, routing or delivering messages
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message has no target")]
    MissingTarget,

    #[error("Recipient {0} not found")]
    RecipientNotFound(ClientId),

    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid client id: {0}")]
    InvalidClientId(String),

    #[error("Failed to encode outbound message: {0}")]
    Encode(String),
}
