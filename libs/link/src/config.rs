use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outbound queue capacity used when none is configured
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// WebSocket handshake timeout used when none (or zero) is configured
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound WebSocket message accepted by a listener
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100_000;

/// Largest total size of upgrade request headers accepted by a listener
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1024;

/// Back-off applied after a failed accept
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Settings shared by every listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind, e.g. `0.0.0.0:7000`
    pub address: String,

    /// Outbound queue capacity of each accepted connection
    pub queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Extra settings of a WebSocket listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Upper bound on TLS plus upgrade handshake time
    pub handshake_timeout: Option<Duration>,

    /// PEM certificate chain; TLS is enabled when this and `key_file` are set
    pub cert_file: Option<PathBuf>,

    /// PEM private key
    pub key_file: Option<PathBuf>,

    pub max_message_size: usize,

    pub max_header_bytes: usize,
}

impl WebSocketConfig {
    /// Effective handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        match self.handshake_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some()
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            cert_file: None,
            key_file: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// Settings of a dialer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Outbound queue capacity of each dialed connection
    pub queue_capacity: usize,

    /// Give up connecting after this long
    pub connect_timeout: Option<Duration>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: None,
        }
    }
}
