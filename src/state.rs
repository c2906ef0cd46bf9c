use std::sync::Arc;

use crate::config::RelayConfig;
use crate::registry::Registry;
use crate::router::MessageRouter;

/// Shared application state
///
/// One instance is built at startup and handed to every session and HTTP
/// handler. Tests build their own isolated instance.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub router: MessageRouter,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    pub max_client_id_len: usize,
    pub max_message_bytes: usize,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        let registry = Arc::new(Registry::new(config.replace_policy, config.send_timeout));
        Self {
            router: MessageRouter::new(registry.clone()),
            registry,
            outbound_buffer: config.outbound_buffer,
            max_client_id_len: config.max_client_id_len,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}
