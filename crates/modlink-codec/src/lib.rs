//! Wire codecs for modlink.
//!
//! Two interchangeable formats implement [`MessageCodec`]:
//!
//! - [`BinaryCodec`]: BSON document layout, exact numeric widths.
//! - [`TextCodec`]: pretty-printed JSON, numbers narrowed on decode.
//!
//! Both write message envelopes with the same field layout (see
//! [`envelope`]) and expose reusable accumulators
//! ([`BinarySerializer`], [`TextSerializer`]) for building field maps
//! incrementally.

pub mod base64;
pub mod binary;
pub mod envelope;
pub mod text;

pub use crate::base64::{from_base64, is_base64, to_base64, to_base64_no_lb, BASE64_PREFIX};
pub use binary::{BinaryCodec, BinaryDeserializer, BinarySerializer};
pub use text::{TextCodec, TextDeserializer, TextSerializer};

use modlink_types::{CodecKind, CodecResult, Message, Object};
use std::sync::Arc;

/// A serializer/deserializer pair for one wire format.
pub trait MessageCodec: Send + Sync {
    /// Short format name for logs.
    fn name(&self) -> &'static str;

    /// Encode a message with its envelope.
    fn serialize_message(&self, message: &Message) -> CodecResult<Vec<u8>>;

    /// Decode bytes produced by [`serialize_message`](Self::serialize_message).
    fn deserialize_message(&self, data: &[u8]) -> CodecResult<Message>;

    /// Encode a bare field map.
    fn serialize_object(&self, object: &Object) -> CodecResult<Vec<u8>>;

    /// Decode a bare field map.
    fn deserialize_object(&self, data: &[u8]) -> CodecResult<Object>;
}

/// Build the codec selected by configuration.
pub fn codec_for(kind: CodecKind, strict: bool) -> Arc<dyn MessageCodec> {
    match kind {
        CodecKind::Binary if strict => Arc::new(BinaryCodec::strict()),
        CodecKind::Binary => Arc::new(BinaryCodec::permissive()),
        CodecKind::Text => Arc::new(TextCodec),
    }
}
