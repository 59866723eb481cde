//! Configuration types for the transport bus and registry.

use serde::{Deserialize, Serialize};

/// Wire format used on a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// BSON-layout binary documents.
    #[default]
    Binary,
    /// Pretty-printed JSON.
    Text,
}

/// Bus and registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// `<role>:<transport>://<address>`, e.g. `server:tcp://127.0.0.1:33221`.
    pub connection: String,
    /// Wire format.
    pub codec: CodecKind,
    /// Default send timeout in ms (`-1` blocks, `0` never waits).
    pub send_timeout_ms: i64,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
    /// Delay between client reconnection attempts.
    pub reconnect_interval_ms: u64,
    /// How long a capability query waits for a reply.
    pub query_timeout_ms: u64,
    /// Write timeout used when the server forwards traffic between peers.
    pub relay_timeout_ms: u64,
    /// Whether a server forwards traffic between its peers.
    pub relay: bool,
    /// Reject unsupported binary element types instead of dropping them.
    pub strict_decoding: bool,
    /// Name stamped on outgoing messages.
    pub identity_name: String,
    /// Class stamped on outgoing messages.
    pub identity_class: String,
}

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection: "client:tcp://127.0.0.1:33221".to_string(),
            codec: CodecKind::Binary,
            send_timeout_ms: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect_interval_ms: 100,
            query_timeout_ms: 250,
            relay_timeout_ms: 1000,
            relay: true,
            strict_decoding: true,
            identity_name: "modlink".to_string(),
            identity_class: String::new(),
        }
    }
}

impl BusConfig {
    /// Defaults with a different connection string.
    pub fn with_connection(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            ..Self::default()
        }
    }
}
