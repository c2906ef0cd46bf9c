//! Process configuration loaded from environment variables

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::ratelimit::RateLimiter;
use crate::registry::ReplacePolicy;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Per-recipient bound on how long a send may wait for queue space
    pub send_timeout: Duration,
    pub outbound_buffer: usize,
    pub max_message_bytes: usize,
    pub max_client_id_len: usize,
    pub replace_policy: ReplacePolicy,
    /// Connect-attempt limiter (None = disabled)
    pub rate_limiter: Option<RateLimiter>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            send_timeout: Duration::from_millis(2000),
            outbound_buffer: 64,
            max_message_bytes: 1024 * 1024,
            max_client_id_len: 128,
            replace_policy: ReplacePolicy::LastWriterWins,
            rate_limiter: Some(RateLimiter::default()),
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rate_limit_enabled = std::env::var("RELAY_RATE_LIMIT")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let rate_limiter = if rate_limit_enabled {
            let max_requests = env_or("RELAY_RATE_LIMIT_MAX", 20);
            let window_secs = env_or("RELAY_RATE_LIMIT_WINDOW", 10u64).max(1);
            Some(RateLimiter::new(
                max_requests,
                Duration::from_secs(window_secs),
            ))
        } else {
            None
        };

        let config = Self {
            host: env_or("RELAY_HOST", defaults.host),
            port: env_or("RELAY_PORT", defaults.port),
            send_timeout: Duration::from_millis(env_or(
                "RELAY_SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )),
            outbound_buffer: env_or("RELAY_OUTBOUND_BUFFER", defaults.outbound_buffer).max(1),
            max_message_bytes: env_or("RELAY_MAX_MESSAGE_BYTES", defaults.max_message_bytes),
            max_client_id_len: env_or("RELAY_MAX_CLIENT_ID_LEN", defaults.max_client_id_len),
            replace_policy: env_or("RELAY_REPLACE_POLICY", defaults.replace_policy),
            rate_limiter,
        };

        tracing::info!(
            addr = %config.addr(),
            send_timeout_ms = config.send_timeout.as_millis() as u64,
            outbound_buffer = config.outbound_buffer,
            replace_policy = ?config.replace_policy,
            rate_limit_enabled,
            "Relay config loaded"
        );

        config
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Parse an environment variable, keeping `default` when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
