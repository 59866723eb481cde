//! Errors from the transport layer.

use modlink_types::CodecError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Bad connection string, role or transport.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Socket setup or delivery failed.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Send timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: i64 },
    #[error("Bus is not active")]
    Inactive,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },
    /// The peer sent something that is not a valid frame.
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl WireError {
    /// Whether this belongs to the transport family (as opposed to bad
    /// configuration or a codec failure).
    pub fn is_transport(&self) -> bool {
        !matches!(self, WireError::Config(_) | WireError::Codec(_))
    }
}
