//! Kernel-specific error types.

use modlink_types::{CodecError, Uid};
use modlink_wire::WireError;
use thiserror::Error;

/// Errors from the capability registry and system facade.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A transport failure, including sends on an inactive bus.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A message could not be built or read.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No activity with this name is registered for the module.
    #[error("Unknown activity '{name}' for module {module}")]
    UnknownActivity { module: Uid, name: String },

    /// The configuration could not be used.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// Whether this wraps a transport-family wire error.
    pub fn is_transport(&self) -> bool {
        matches!(self, KernelError::Wire(e) if e.is_transport())
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
