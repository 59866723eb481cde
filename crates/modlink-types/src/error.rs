//! Shared error types for value access and the wire codecs.

use crate::value::ValueType;
use thiserror::Error;

/// A [`Value`](crate::value::Value) was read as a variant it does not hold.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Type mismatch: expected {expected}, found {found}")]
pub struct TypeMismatch {
    /// The variant the caller asked for.
    pub expected: ValueType,
    /// The variant actually stored.
    pub found: ValueType,
}

/// Errors raised while encoding or decoding field maps and envelopes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The input could not be parsed at all.
    #[error("Malformed input at byte offset {offset}: {message}")]
    Malformed {
        /// Byte offset reported by the parser.
        offset: usize,
        /// Parser diagnostic.
        message: String,
    },

    /// A document's declared length disagrees with the bytes available.
    #[error("Document size mismatch at '{path}': {declared} != {actual}")]
    SizeMismatch {
        /// Dotted path of the offending document (empty for the root).
        path: String,
        /// Length declared in the document header.
        declared: usize,
        /// Length actually available.
        actual: usize,
    },

    /// The input ended in the middle of an element.
    #[error("Truncated element at '{path}'")]
    Truncated {
        /// Dotted path of the offending field.
        path: String,
    },

    /// An element carried a type tag this codec does not handle.
    #[error("Unknown type tag 0x{tag:02x} for field '{path}'")]
    UnknownType {
        /// Dotted path of the offending field.
        path: String,
        /// The raw tag byte.
        tag: u8,
    },

    /// A field name or value cannot be represented.
    #[error("Invalid field '{path}': {reason}")]
    InvalidField {
        /// Dotted path of the offending field.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A required envelope field is absent.
    #[error("Missing envelope field '{0}'")]
    MissingField(String),

    /// An envelope field holds the wrong variant.
    #[error("Envelope field '{field}': {source}")]
    FieldType {
        /// Name of the envelope field.
        field: String,
        /// The underlying mismatch.
        #[source]
        source: TypeMismatch,
    },

    /// The envelope names a message type ordinal outside the known range.
    #[error("Unknown message type ordinal {0}")]
    UnknownMessageType(i32),
}

impl CodecError {
    /// Shorthand for [`CodecError::InvalidField`].
    pub fn invalid_field(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
