//! Base64 with the `BASE64:\n` sentinel used to carry binary data in text.
//!
//! The text codec has no binary type, so blobs travel as strings that start
//! with [`BASE64_PREFIX`]. [`is_base64`] is deliberately strict: only a
//! prefixed, well-formed payload is treated as binary.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use modlink_types::{CodecError, CodecResult};
use regex_lite::Regex;
use std::sync::OnceLock;

/// Marker preceding every base64 payload.
pub const BASE64_PREFIX: &[u8; 8] = b"BASE64:\n";

/// Encoded output is wrapped at this many characters.
pub const LINE_WIDTH: usize = 72;

const DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn payload_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9+/]{4}|\n|\r\n)*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?$")
            .expect("base64 payload regex is valid")
    })
}

/// Prefix + base64, with a `\n` after every [`LINE_WIDTH`] characters.
pub fn to_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(
        BASE64_PREFIX.len() + encoded.len() + encoded.len() / LINE_WIDTH,
    );
    out.push_str("BASE64:\n");
    for (i, chunk) in encoded.as_bytes().chunks(LINE_WIDTH).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        // Base64 output is ASCII, so every chunk boundary is a char boundary.
        out.extend(chunk.iter().map(|&b| b as char));
    }
    out
}

/// Prefix + base64 on a single line.
pub fn to_base64_no_lb(data: &[u8]) -> String {
    format!("BASE64:\n{}", STANDARD.encode(data))
}

/// True when `data` starts with the sentinel and the rest is valid base64.
pub fn is_base64(data: &[u8]) -> bool {
    let Some(payload) = data.strip_prefix(BASE64_PREFIX.as_slice()) else {
        return false;
    };
    match std::str::from_utf8(payload) {
        Ok(text) => payload_pattern().is_match(text),
        Err(_) => false,
    }
}

/// Decode a (possibly prefixed, possibly wrapped) base64 payload.
///
/// Decoding stops at the first `=`; whitespace is ignored.
pub fn from_base64(data: &[u8]) -> CodecResult<Vec<u8>> {
    let payload = data
        .strip_prefix(BASE64_PREFIX.as_slice())
        .unwrap_or(data);
    let end = payload
        .iter()
        .position(|&b| b == b'=')
        .unwrap_or(payload.len());
    let compact: Vec<u8> = payload[..end]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    DECODER
        .decode(compact)
        .map_err(|e| CodecError::invalid_field("", format!("invalid base64: {e}")))
}
