//! Binary codec using the BSON document layout.
//!
//! Documents are `i32 length, elements, 0x00`, each element being
//! `tag, cstring key, payload`, all little endian. Arrays are documents with
//! keys `"0"`, `"1"`, … and [`Time`] travels as a UTC datetime holding
//! nanoseconds.

use crate::envelope::{envelope_entries, message_from_object};
use crate::MessageCodec;
use bytes::{Buf, BufMut, BytesMut};
use modlink_types::{CodecError, CodecResult, Message, Object, Time, Uid, Value};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// BSON element type tags.
pub mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOLEAN: u8 = 0x08;
    pub const DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const DB_POINTER: u8 = 0x0C;
    pub const CODE: u8 = 0x0D;
    pub const SYMBOL: u8 = 0x0E;
    pub const CODE_WITH_SCOPE: u8 = 0x0F;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const DECIMAL128: u8 = 0x13;
    pub const MIN_KEY: u8 = 0xFF;
    pub const MAX_KEY: u8 = 0x7F;
}

/// Binary subtype for ordinary blobs.
pub const SUBTYPE_GENERIC: u8 = 0x00;
/// Binary subtype written by [`BinarySerializer::append_uid`].
pub const SUBTYPE_UID: u8 = 0x04;

/// Smallest valid document: length prefix plus terminator.
const MIN_DOCUMENT_LEN: usize = 5;

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn length_prefix(len: usize, path: &str) -> CodecResult<i32> {
    i32::try_from(len).map_err(|_| CodecError::invalid_field(path, "too large for BSON"))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_cstring(buf: &mut BytesMut, s: &str, path: &str) -> CodecResult<()> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::invalid_field(path, "name contains a NUL byte"));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn write_element(buf: &mut BytesMut, key: &str, value: &Value, path: &str) -> CodecResult<()> {
    let element_tag = match value {
        Value::Undefined => tag::UNDEFINED,
        Value::Null => tag::NULL,
        Value::Array(_) => tag::ARRAY,
        Value::BinData(_) => tag::BINARY,
        Value::Boolean(_) => tag::BOOLEAN,
        Value::Double(_) => tag::DOUBLE,
        Value::Int32(_) => tag::INT32,
        Value::Int64(_) => tag::INT64,
        Value::String(_) => tag::STRING,
        Value::Time(_) => tag::DATETIME,
        Value::Object(_) => tag::DOCUMENT,
    };
    buf.put_u8(element_tag);
    put_cstring(buf, key, path)?;

    match value {
        Value::Undefined | Value::Null => {}
        Value::Array(items) => {
            let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
            write_document(buf, keys.iter().map(String::as_str).zip(items), path)?;
        }
        Value::BinData(bytes) => {
            buf.put_i32_le(length_prefix(bytes.len(), path)?);
            buf.put_u8(SUBTYPE_GENERIC);
            buf.put_slice(bytes);
        }
        Value::Boolean(b) => buf.put_u8(u8::from(*b)),
        Value::Double(d) => buf.put_f64_le(*d),
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::String(s) => {
            buf.put_i32_le(length_prefix(s.len() + 1, path)?);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
        Value::Time(t) => buf.put_i64_le(t.as_nanos()),
        Value::Object(object) => {
            write_document(buf, object.iter().map(|(k, v)| (k.as_str(), v)), path)?;
        }
    }
    Ok(())
}

fn write_document<'a>(
    buf: &mut BytesMut,
    entries: impl Iterator<Item = (&'a str, &'a Value)>,
    path: &str,
) -> CodecResult<()> {
    let start = buf.len();
    buf.put_i32_le(0);
    for (key, value) in entries {
        write_element(buf, key, value, &child_path(path, key))?;
    }
    buf.put_u8(0);
    let len = length_prefix(buf.len() - start, path)?;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Reusable accumulator building one BSON document.
///
/// [`get_buffer`](Self::get_buffer) closes the document; the next append
/// starts a fresh one.
#[derive(Debug)]
pub struct BinarySerializer {
    buf: BytesMut,
    finished: bool,
}

impl BinarySerializer {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(0);
        Self {
            buf,
            finished: false,
        }
    }

    /// Discard everything appended so far.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.put_i32_le(0);
        self.finished = false;
    }

    fn reopen(&mut self) {
        if self.finished {
            self.clear();
        }
    }

    /// Append one field. On error the document is left as it was.
    pub fn append_field(&mut self, name: &str, value: &Value) -> CodecResult<()> {
        self.reopen();
        let mark = self.buf.len();
        let result = write_element(&mut self.buf, name, value, name)
            .and_then(|()| self.check_size(name));
        if result.is_err() {
            self.buf.truncate(mark);
        }
        result
    }

    /// The closed document, terminator included, must fit its i32 prefix.
    fn check_size(&self, name: &str) -> CodecResult<()> {
        length_prefix(self.buf.len() + 1, name).map(|_| ())
    }

    /// Append a uid as an 8-byte binary blob of subtype [`SUBTYPE_UID`].
    pub fn append_uid(&mut self, name: &str, uid: Uid) -> CodecResult<()> {
        self.reopen();
        let mark = self.buf.len();
        self.buf.put_u8(tag::BINARY);
        if let Err(e) = put_cstring(&mut self.buf, name, name) {
            self.buf.truncate(mark);
            return Err(e);
        }
        self.buf.put_i32_le(8);
        self.buf.put_u8(SUBTYPE_UID);
        self.buf.put_u64_le(uid);
        if let Err(e) = self.check_size(name) {
            self.buf.truncate(mark);
            return Err(e);
        }
        Ok(())
    }

    pub fn append_null(&mut self, name: &str) -> CodecResult<()> {
        self.append_field(name, &Value::Null)
    }

    pub fn append_undefined(&mut self, name: &str) -> CodecResult<()> {
        self.append_field(name, &Value::Undefined)
    }

    /// Close the document and return its bytes, duplicate keys resolved
    /// last-write-wins.
    pub fn get_buffer(&mut self) -> Vec<u8> {
        if !self.finished {
            self.buf.put_u8(0);
            self.finished = true;
            match length_prefix(self.buf.len(), "") {
                Ok(len) => self.buf[0..4].copy_from_slice(&len.to_le_bytes()),
                Err(e) => {
                    warn!(size = self.buf.len(), error = %e, "BSON document exceeds i32 length");
                    return Vec::new();
                }
            }

            match has_duplicate_keys(&self.buf) {
                Ok(false) => {}
                Ok(true) => match normalize_document(&self.buf, "") {
                    Ok(doc) => {
                        debug!(
                            before = self.buf.len(),
                            after = doc.len(),
                            "Rewrote BSON document with duplicate keys"
                        );
                        self.buf = BytesMut::from(&doc[..]);
                    }
                    Err(e) => warn!(error = %e, "Failed to normalize BSON document"),
                },
                Err(e) => warn!(error = %e, "Failed to scan BSON document for duplicates"),
            }
        }
        self.buf.to_vec()
    }
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Raw element scanning (duplicate detection and skipping)
// ---------------------------------------------------------------------------

fn declared_len(bytes: &[u8], path: &str) -> CodecResult<usize> {
    if bytes.len() < 4 {
        return Err(CodecError::Truncated {
            path: path.to_string(),
        });
    }
    let mut header = &bytes[..4];
    let len = header.get_i32_le();
    usize::try_from(len).map_err(|_| CodecError::invalid_field(path, "negative length"))
}

fn cstring_len(bytes: &[u8], path: &str) -> CodecResult<usize> {
    bytes
        .iter()
        .position(|&b| b == 0)
        .map(|i| i + 1)
        .ok_or_else(|| CodecError::Truncated {
            path: path.to_string(),
        })
}

/// Size of an element payload starting at `rest`.
fn value_len(element_tag: u8, rest: &[u8], path: &str) -> CodecResult<usize> {
    let len = match element_tag {
        tag::UNDEFINED | tag::NULL | tag::MIN_KEY | tag::MAX_KEY => 0,
        tag::BOOLEAN => 1,
        tag::INT32 => 4,
        tag::DOUBLE | tag::DATETIME | tag::TIMESTAMP | tag::INT64 => 8,
        tag::OBJECT_ID => 12,
        tag::DECIMAL128 => 16,
        tag::STRING | tag::CODE | tag::SYMBOL => 4 + declared_len(rest, path)?,
        tag::DOCUMENT | tag::ARRAY | tag::CODE_WITH_SCOPE => declared_len(rest, path)?,
        tag::BINARY => 5 + declared_len(rest, path)?,
        tag::DB_POINTER => 4 + declared_len(rest, path)? + 12,
        tag::REGEX => {
            let pattern = cstring_len(rest, path)?;
            pattern + cstring_len(&rest[pattern..], path)?
        }
        other => {
            return Err(CodecError::UnknownType {
                path: path.to_string(),
                tag: other,
            })
        }
    };
    if len > rest.len() {
        return Err(CodecError::Truncated {
            path: path.to_string(),
        });
    }
    Ok(len)
}

struct RawElement<'a> {
    tag: u8,
    key: &'a [u8],
    value: &'a [u8],
}

/// Split a complete document (length prefix included) into raw elements.
fn raw_elements<'a>(doc: &'a [u8], path: &str) -> CodecResult<Vec<RawElement<'a>>> {
    if doc.len() < MIN_DOCUMENT_LEN {
        return Err(CodecError::Truncated {
            path: path.to_string(),
        });
    }
    let body = &doc[4..doc.len() - 1];
    let mut elements = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let element_tag = body[pos];
        pos += 1;
        let key_len = cstring_len(&body[pos..], path)?;
        let key = &body[pos..pos + key_len - 1];
        pos += key_len;
        let child = child_path(path, &String::from_utf8_lossy(key));
        let len = value_len(element_tag, &body[pos..], &child)?;
        elements.push(RawElement {
            tag: element_tag,
            key,
            value: &body[pos..pos + len],
        });
        pos += len;
    }
    Ok(elements)
}

fn has_duplicate_keys(doc: &[u8]) -> CodecResult<bool> {
    let elements = raw_elements(doc, "")?;
    let mut seen = HashSet::with_capacity(elements.len());
    for element in &elements {
        if !seen.insert(element.key) {
            return Ok(true);
        }
        if matches!(element.tag, tag::DOCUMENT | tag::ARRAY) && has_duplicate_keys(element.value)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Rebuild `doc` so each key appears once, at its first position, carrying
/// its last value. Nested documents are normalized too.
fn normalize_document(doc: &[u8], path: &str) -> CodecResult<Vec<u8>> {
    let elements = raw_elements(doc, path)?;
    let mut order: Vec<(u8, &[u8], Cow<'_, [u8]>)> = Vec::with_capacity(elements.len());
    let mut index: HashMap<&[u8], usize> = HashMap::with_capacity(elements.len());

    for element in elements {
        let value = if matches!(element.tag, tag::DOCUMENT | tag::ARRAY) {
            let child = child_path(path, &String::from_utf8_lossy(element.key));
            Cow::Owned(normalize_document(element.value, &child)?)
        } else {
            Cow::Borrowed(element.value)
        };
        match index.get(element.key) {
            Some(&i) => order[i] = (element.tag, element.key, value),
            None => {
                index.insert(element.key, order.len());
                order.push((element.tag, element.key, value));
            }
        }
    }

    let mut out = BytesMut::with_capacity(doc.len());
    out.put_i32_le(0);
    for (element_tag, key, value) in &order {
        out.put_u8(*element_tag);
        out.put_slice(key);
        out.put_u8(0);
        out.put_slice(value);
    }
    out.put_u8(0);
    let len = length_prefix(out.len(), path)?;
    out[0..4].copy_from_slice(&len.to_le_bytes());
    Ok(out.to_vec())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn take<'a>(cur: &mut &'a [u8], n: usize, path: &str) -> CodecResult<&'a [u8]> {
    if cur.len() < n {
        return Err(CodecError::Truncated {
            path: path.to_string(),
        });
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn utf8(bytes: &[u8], path: &str) -> CodecResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CodecError::invalid_field(path, "string is not valid UTF-8"))
}

fn read_cstring(cur: &mut &[u8], path: &str) -> CodecResult<String> {
    let len = cstring_len(cur, path)?;
    let bytes = take(cur, len, path)?;
    utf8(&bytes[..len - 1], path)
}

fn read_string(cur: &mut &[u8], path: &str) -> CodecResult<String> {
    let len = declared_len(cur, path)?;
    take(cur, 4, path)?;
    if len == 0 {
        return Err(CodecError::invalid_field(path, "zero string length"));
    }
    let bytes = take(cur, len, path)?;
    if bytes[len - 1] != 0 {
        return Err(CodecError::invalid_field(path, "string is not NUL terminated"));
    }
    utf8(&bytes[..len - 1], path)
}

/// Decoder for BSON documents.
///
/// In strict mode an element of a BSON type this model cannot represent
/// (DBPointer, Decimal128, MinKey, MaxKey) is an error; in permissive mode
/// it is dropped. Bytes that are not a BSON tag at all are always an error,
/// since the element cannot be skipped.
#[derive(Debug, Clone, Copy)]
pub struct BinaryDeserializer {
    strict: bool,
}

impl BinaryDeserializer {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Decode a complete document.
    pub fn deserialize(&self, data: &[u8]) -> CodecResult<Object> {
        let declared = declared_len(data, "")?;
        if declared != data.len() {
            return Err(CodecError::SizeMismatch {
                path: String::new(),
                declared,
                actual: data.len(),
            });
        }
        Ok(self.read_document(data, "")?.into_iter().collect())
    }

    fn read_document(&self, doc: &[u8], path: &str) -> CodecResult<Vec<(String, Value)>> {
        if doc.len() < MIN_DOCUMENT_LEN {
            return Err(CodecError::SizeMismatch {
                path: path.to_string(),
                declared: doc.len(),
                actual: MIN_DOCUMENT_LEN,
            });
        }
        if doc[doc.len() - 1] != 0 {
            return Err(CodecError::invalid_field(path, "document is not terminated"));
        }
        let mut cur = &doc[4..doc.len() - 1];
        let mut entries = Vec::new();
        while !cur.is_empty() {
            let element_tag = take(&mut cur, 1, path)?[0];
            let key = read_cstring(&mut cur, path)?;
            let child = child_path(path, &key);
            if let Some(value) = self.read_value(element_tag, &mut cur, &child)? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    fn read_embedded(&self, cur: &mut &[u8], path: &str) -> CodecResult<Vec<(String, Value)>> {
        let declared = declared_len(cur, path)?;
        if declared < MIN_DOCUMENT_LEN || declared > cur.len() {
            return Err(CodecError::SizeMismatch {
                path: path.to_string(),
                declared,
                actual: cur.len(),
            });
        }
        let doc = take(cur, declared, path)?;
        self.read_document(doc, path)
    }

    fn read_value(&self, element_tag: u8, cur: &mut &[u8], path: &str) -> CodecResult<Option<Value>> {
        let value = match element_tag {
            tag::DOUBLE => Value::Double(take(cur, 8, path)?.get_f64_le()),
            tag::STRING | tag::CODE | tag::SYMBOL => Value::String(read_string(cur, path)?),
            tag::DOCUMENT => Value::Object(self.read_embedded(cur, path)?.into_iter().collect()),
            tag::ARRAY => Value::Array(
                self.read_embedded(cur, path)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect(),
            ),
            tag::BINARY => {
                let len = declared_len(cur, path)?;
                take(cur, 5, path)?;
                Value::BinData(take(cur, len, path)?.to_vec())
            }
            tag::UNDEFINED => Value::Undefined,
            tag::OBJECT_ID => Value::BinData(take(cur, 12, path)?.to_vec()),
            tag::BOOLEAN => Value::Boolean(take(cur, 1, path)?[0] != 0),
            tag::DATETIME => Value::Time(Time::from_nanos(take(cur, 8, path)?.get_i64_le())),
            tag::NULL => Value::Null,
            tag::REGEX => {
                let pattern = read_cstring(cur, path)?;
                read_cstring(cur, path)?;
                Value::String(pattern)
            }
            tag::CODE_WITH_SCOPE => {
                let total = value_len(element_tag, cur, path)?;
                let mut scoped = take(cur, total, path)?;
                take(&mut scoped, 4, path)?;
                Value::String(read_string(&mut scoped, path)?)
            }
            tag::INT32 => Value::Int32(take(cur, 4, path)?.get_i32_le()),
            tag::TIMESTAMP => {
                let mut raw = take(cur, 8, path)?;
                let increment = i64::from(raw.get_u32_le());
                let seconds = i64::from(raw.get_u32_le());
                Value::Time(Time::from_nanos(
                    seconds * Time::NANOS_PER_SECOND + increment * 1_000_000,
                ))
            }
            tag::INT64 => Value::Int64(take(cur, 8, path)?.get_i64_le()),
            tag::DB_POINTER | tag::DECIMAL128 | tag::MIN_KEY | tag::MAX_KEY => {
                if self.strict {
                    return Err(CodecError::UnknownType {
                        path: path.to_string(),
                        tag: element_tag,
                    });
                }
                let len = value_len(element_tag, cur, path)?;
                take(cur, len, path)?;
                debug!(field = path, tag = element_tag, "Dropped unsupported BSON element");
                return Ok(None);
            }
            other => {
                return Err(CodecError::UnknownType {
                    path: path.to_string(),
                    tag: other,
                })
            }
        };
        Ok(Some(value))
    }
}

impl Default for BinaryDeserializer {
    fn default() -> Self {
        Self::new(true)
    }
}

/// [`MessageCodec`] for the BSON layout.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec {
    strict: bool,
}

impl BinaryCodec {
    /// Unsupported element types are an error.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Unsupported element types are dropped.
    pub fn permissive() -> Self {
        Self { strict: false }
    }

    fn deserializer(&self) -> BinaryDeserializer {
        BinaryDeserializer::new(self.strict)
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::strict()
    }
}

impl MessageCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize_message(&self, message: &Message) -> CodecResult<Vec<u8>> {
        let mut serializer = BinarySerializer::new();
        for (name, value) in envelope_entries(message) {
            serializer.append_field(name, &value)?;
        }
        Ok(serializer.get_buffer())
    }

    fn deserialize_message(&self, data: &[u8]) -> CodecResult<Message> {
        message_from_object(self.deserializer().deserialize(data)?)
    }

    fn serialize_object(&self, object: &Object) -> CodecResult<Vec<u8>> {
        let mut serializer = BinarySerializer::new();
        for (name, value) in object {
            serializer.append_field(name, value)?;
        }
        Ok(serializer.get_buffer())
    }

    fn deserialize_object(&self, data: &[u8]) -> CodecResult<Object> {
        self.deserializer().deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_types::{MessageType, ModuleAddress};

    fn single(value: Value) -> Vec<u8> {
        let mut s = BinarySerializer::new();
        s.append_field("test", &value).unwrap();
        s.get_buffer()
    }

    fn decode(data: &[u8]) -> Object {
        BinaryDeserializer::default().deserialize(data).unwrap()
    }

    #[test]
    fn test_string_layout() {
        let buf = single(Value::from("test"));
        assert_eq!(
            buf,
            [
                0x14, 0x00, 0x00, 0x00, 0x02, 0x74, 0x65, 0x73, 0x74, 0x00, 0x05, 0x00, 0x00,
                0x00, 0x74, 0x65, 0x73, 0x74, 0x00, 0x00
            ]
        );
        assert_eq!(decode(&buf)["test"], Value::from("test"));
    }

    #[test]
    fn test_int32_layout() {
        assert_eq!(
            single(Value::Int32(777)),
            [0x0F, 0x00, 0x00, 0x00, 0x10, 0x74, 0x65, 0x73, 0x74, 0x00, 0x09, 0x03, 0x00, 0x00, 0x00]
        );
        let buf = single(Value::Int32(-1));
        assert_eq!(
            buf,
            [0x0F, 0x00, 0x00, 0x00, 0x10, 0x74, 0x65, 0x73, 0x74, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]
        );
        assert_eq!(decode(&buf)["test"], Value::Int32(-1));
    }

    #[test]
    fn test_double_layout() {
        let buf = single(Value::Double(0.777));
        assert_eq!(
            buf,
            [
                0x13, 0x00, 0x00, 0x00, 0x01, 0x74, 0x65, 0x73, 0x74, 0x00, 0x77, 0xBE, 0x9F,
                0x1A, 0x2F, 0xDD, 0xE8, 0x3F, 0x00
            ]
        );
        assert_eq!(decode(&buf)["test"], Value::Double(0.777));
    }

    #[test]
    fn test_bool_null_undefined_layout() {
        assert_eq!(
            single(Value::Boolean(true)),
            [0x0C, 0x00, 0x00, 0x00, 0x08, 0x74, 0x65, 0x73, 0x74, 0x00, 0x01, 0x00]
        );
        assert_eq!(
            single(Value::Boolean(false)),
            [0x0C, 0x00, 0x00, 0x00, 0x08, 0x74, 0x65, 0x73, 0x74, 0x00, 0x00, 0x00]
        );
        let null = single(Value::Null);
        assert_eq!(null, [0x0B, 0x00, 0x00, 0x00, 0x0A, 0x74, 0x65, 0x73, 0x74, 0x00, 0x00]);
        assert_eq!(decode(&null)["test"], Value::Null);
        let undefined = single(Value::Undefined);
        assert_eq!(
            undefined,
            [0x0B, 0x00, 0x00, 0x00, 0x06, 0x74, 0x65, 0x73, 0x74, 0x00, 0x00]
        );
        assert_eq!(decode(&undefined)["test"], Value::Undefined);
    }

    #[test]
    fn test_bindata_layout() {
        let buf = single(Value::BinData(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(
            buf,
            [
                0x14, 0x00, 0x00, 0x00, 0x05, 0x74, 0x65, 0x73, 0x74, 0x00, 0x04, 0x00, 0x00,
                0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x00
            ]
        );
        assert_eq!(
            decode(&buf)["test"],
            Value::BinData(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
    }

    #[test]
    fn test_nested_object_layout() {
        let mut inner = Object::new();
        inner.insert("a".into(), Value::from("b"));
        inner.insert("b".into(), Value::Int64(-100_000_000_000));
        let buf = single(Value::Object(inner.clone()));
        assert_eq!(
            buf,
            [
                0x24, 0x00, 0x00, 0x00, 0x03, 0x74, 0x65, 0x73, 0x74, 0x00, 0x19, 0x00, 0x00,
                0x00, 0x02, 0x61, 0x00, 0x02, 0x00, 0x00, 0x00, 0x62, 0x00, 0x12, 0x62, 0x00,
                0x00, 0x18, 0x89, 0xB7, 0xE8, 0xFF, 0xFF, 0xFF, 0x00, 0x00
            ]
        );
        assert_eq!(decode(&buf)["test"], Value::Object(inner));
    }

    #[test]
    fn test_every_type_roundtrips_exactly() {
        let mut inner = Object::new();
        inner.insert("deep".into(), Value::Array(vec![Value::Null, Value::Int64(1)]));
        let values = vec![
            Value::Undefined,
            Value::Null,
            Value::Array(vec![Value::Int32(1), Value::from("two"), Value::Double(3.0)]),
            Value::BinData(vec![]),
            Value::Boolean(true),
            Value::Double(-0.5),
            Value::Int32(i32::MIN),
            Value::Int64(i64::MAX),
            Value::from(""),
            Value::Time(Time::from_nanos(1_506_883_943_123_456_789)),
            Value::Object(inner),
        ];
        let mut object = Object::new();
        for (i, v) in values.into_iter().enumerate() {
            object.insert(format!("f{i}"), v);
        }
        let codec = BinaryCodec::default();
        let bytes = codec.serialize_object(&object).unwrap();
        assert_eq!(codec.deserialize_object(&bytes).unwrap(), object);
    }

    #[test]
    fn test_array_keeps_element_order() {
        let items: Vec<Value> = (0..15).map(Value::Int32).collect();
        let buf = single(Value::Array(items.clone()));
        assert_eq!(decode(&buf)["test"], Value::Array(items));
    }

    #[test]
    fn test_duplicate_keys_last_write_wins() {
        let mut dup = BinarySerializer::new();
        dup.append_field("a", &Value::Int32(1)).unwrap();
        dup.append_field("a", &Value::Int32(2)).unwrap();

        let mut plain = BinarySerializer::new();
        plain.append_field("a", &Value::Int32(2)).unwrap();

        assert_eq!(dup.get_buffer(), plain.get_buffer());
    }

    #[test]
    fn test_duplicate_key_keeps_first_position() {
        let mut s = BinarySerializer::new();
        s.append_field("a", &Value::Int32(1)).unwrap();
        s.append_field("b", &Value::from("x")).unwrap();
        s.append_field("a", &Value::Int64(3)).unwrap();
        let buf = s.get_buffer();

        let elements = raw_elements(&buf, "").unwrap();
        let keys: Vec<_> = elements.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"b"[..]]);

        let object = decode(&buf);
        assert_eq!(object["a"], Value::Int64(3));
        assert_eq!(object["b"], Value::from("x"));
    }

    #[test]
    fn test_nested_duplicates_normalized() {
        // {"outer": {"k": 1, "k": 2}} assembled by hand.
        let mut inner = BytesMut::new();
        inner.put_i32_le(0);
        for v in [1, 2] {
            inner.put_u8(tag::INT32);
            inner.put_slice(b"k\0");
            inner.put_i32_le(v);
        }
        inner.put_u8(0);
        let len = inner.len() as i32;
        inner[0..4].copy_from_slice(&len.to_le_bytes());

        let mut outer = BytesMut::new();
        outer.put_i32_le(0);
        outer.put_u8(tag::DOCUMENT);
        outer.put_slice(b"outer\0");
        outer.put_slice(&inner);
        outer.put_u8(0);
        let len = outer.len() as i32;
        outer[0..4].copy_from_slice(&len.to_le_bytes());

        assert!(has_duplicate_keys(&outer).unwrap());
        let normalized = normalize_document(&outer, "").unwrap();
        assert!(!has_duplicate_keys(&normalized).unwrap());

        let mut expected = Object::new();
        expected.insert("k".into(), Value::Int32(2));
        assert_eq!(decode(&normalized)["outer"], Value::Object(expected));
    }

    #[test]
    fn test_append_after_get_buffer_starts_fresh() {
        let mut s = BinarySerializer::new();
        s.append_field("test", &Value::from("test")).unwrap();
        let first = s.get_buffer();
        assert_eq!(s.get_buffer(), first);

        s.append_field("x", &Value::Int32(1)).unwrap();
        let second = decode(&s.get_buffer());
        assert_eq!(second.len(), 1);
        assert_eq!(second["x"], Value::Int32(1));

        s.clear();
        assert_eq!(s.get_buffer(), [0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_append_uid() {
        let mut s = BinarySerializer::new();
        s.append_uid("id", 0x0102_0304_0506_0708).unwrap();
        let buf = s.get_buffer();
        assert_eq!(buf[4], tag::BINARY);
        assert_eq!(&buf[8..13], &[0x08, 0x00, 0x00, 0x00, SUBTYPE_UID]);
        assert_eq!(
            decode(&buf)["id"],
            Value::BinData(vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01])
        );
    }

    #[test]
    fn test_document_length_limit() {
        assert_eq!(length_prefix(i32::MAX as usize, "doc").unwrap(), i32::MAX);
        assert!(matches!(
            length_prefix(i32::MAX as usize + 1, "doc"),
            Err(CodecError::InvalidField { path, .. }) if path == "doc"
        ));

        let mut s = BinarySerializer::new();
        s.append_field("blob", &Value::BinData(vec![7; 1000])).unwrap();
        let bytes = s.get_buffer();
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(declared as usize, bytes.len());
    }

    #[test]
    fn test_nul_in_key_rejected_without_corruption() {
        let mut s = BinarySerializer::new();
        s.append_field("ok", &Value::Int32(1)).unwrap();
        let err = s.append_field("bad\0key", &Value::Int32(2)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { .. }));

        let mut inner = Object::new();
        inner.insert("in\0ner".into(), Value::Null);
        assert!(s.append_field("nested", &Value::Object(inner)).is_err());

        let object = decode(&s.get_buffer());
        assert_eq!(object.len(), 1);
        assert_eq!(object["ok"], Value::Int32(1));
    }

    #[test]
    fn test_size_mismatch() {
        let mut buf = single(Value::from("test"));
        buf.push(0);
        let err = BinaryDeserializer::default().deserialize(&buf).unwrap_err();
        assert_eq!(
            err,
            CodecError::SizeMismatch {
                path: String::new(),
                declared: 20,
                actual: 21
            }
        );
        assert!(err.to_string().contains("20 != 21"));
    }

    #[test]
    fn test_nested_size_mismatch_names_field() {
        let mut inner = Object::new();
        inner.insert("a".into(), Value::from("b"));
        let mut buf = single(Value::Object(inner));
        // Nested length lives right after "\x03test\0".
        buf[10] = 0x7F;
        let err = BinaryDeserializer::default().deserialize(&buf).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { ref path, .. } if path == "test"));
    }

    #[test]
    fn test_truncated_input() {
        let err = BinaryDeserializer::default().deserialize(&[0x05, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    fn doc_with_decimal128() -> Vec<u8> {
        let mut doc = BytesMut::new();
        doc.put_i32_le(0);
        doc.put_u8(tag::INT32);
        doc.put_slice(b"keep\0");
        doc.put_i32_le(5);
        doc.put_u8(tag::DECIMAL128);
        doc.put_slice(b"money\0");
        doc.put_slice(&[0u8; 16]);
        doc.put_u8(0);
        let len = doc.len() as i32;
        doc[0..4].copy_from_slice(&len.to_le_bytes());
        doc.to_vec()
    }

    #[test]
    fn test_unsupported_type_strict_and_permissive() {
        let doc = doc_with_decimal128();
        let err = BinaryCodec::strict().deserialize_object(&doc).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownType {
                path: "money".into(),
                tag: tag::DECIMAL128
            }
        );

        let object = BinaryCodec::permissive().deserialize_object(&doc).unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["keep"], Value::Int32(5));
    }

    #[test]
    fn test_foreign_tag_is_always_an_error() {
        let mut doc = doc_with_decimal128();
        // Tag byte of the second element.
        doc[14] = 0x42;
        let err = BinaryCodec::permissive().deserialize_object(&doc).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType { tag: 0x42, .. }));
    }

    #[test]
    fn test_foreign_bson_types_are_mapped() {
        let mut doc = BytesMut::new();
        doc.put_i32_le(0);
        doc.put_u8(tag::OBJECT_ID);
        doc.put_slice(b"oid\0");
        doc.put_slice(&[7u8; 12]);
        doc.put_u8(tag::SYMBOL);
        doc.put_slice(b"sym\0");
        doc.put_i32_le(3);
        doc.put_slice(b"ab\0");
        doc.put_u8(tag::REGEX);
        doc.put_slice(b"re\0");
        doc.put_slice(b"^a+$\0i\0");
        doc.put_u8(tag::TIMESTAMP);
        doc.put_slice(b"ts\0");
        doc.put_u32_le(250);
        doc.put_u32_le(10);
        doc.put_u8(0);
        let len = doc.len() as i32;
        doc[0..4].copy_from_slice(&len.to_le_bytes());

        let object = decode(&doc);
        assert_eq!(object["oid"], Value::BinData(vec![7u8; 12]));
        assert_eq!(object["sym"], Value::from("ab"));
        assert_eq!(object["re"], Value::from("^a+$"));
        assert_eq!(
            object["ts"],
            Value::Time(Time::from_nanos(10_250_000_000))
        );
    }

    #[test]
    fn test_echo_request_message_roundtrip() {
        let mut fields = Object::new();
        fields.insert("test".into(), Value::from("test_val"));
        let message = Message::new(MessageType::EchoRequest, fields)
            .with_sender(ModuleAddress::new(17, "core", "system"));

        let codec = BinaryCodec::default();
        let bytes = codec.serialize_message(&message).unwrap();
        let decoded = codec.deserialize_message(&bytes).unwrap();

        assert_eq!(decoded.get_type(), MessageType::EchoRequest);
        assert_eq!(decoded.get_fields()["test"].as_string().unwrap(), "test_val");
        assert_eq!(decoded, message);
    }
}
