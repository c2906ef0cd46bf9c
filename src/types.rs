use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RelayError;

/// Opaque, caller-chosen client identity (taken from the connection path)
pub type ClientId = String;

/// Identifies one accepted transport connection.
///
/// Two connections that present the same [`ClientId`] still get distinct
/// connection ids, which is how a replaced session is told apart from its
/// replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a client id supplied by a connecting peer.
pub fn validate_client_id(id: &str, max_len: usize) -> Result<(), RelayError> {
    if id.trim().is_empty() {
        return Err(RelayError::InvalidClientId("client id is empty".to_string()));
    }
    if id.len() > max_len {
        return Err(RelayError::InvalidClientId(format!(
            "client id exceeds {} bytes",
            max_len
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(RelayError::InvalidClientId(
            "client id contains control characters".to_string(),
        ));
    }
    Ok(())
}
