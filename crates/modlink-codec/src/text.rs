//! Text codec: pretty-printed JSON with conventions for the types JSON lacks.
//!
//! Binary data is written as a [`BASE64_PREFIX`](crate::base64::BASE64_PREFIX)
//! string and times as `YYYY-MM-DDTHH:MM:SS.fffZ`. Decoding recognizes both
//! forms, and picks the narrowest integer type for numbers, so the text image
//! of a value is type-widened rather than exact.

use crate::base64::{from_base64, is_base64, to_base64_no_lb};
use crate::envelope::{envelope_entries, message_from_object};
use crate::MessageCodec;
use chrono::{NaiveDate, NaiveTime};
use modlink_types::{CodecError, CodecResult, Message, Object, Time, Uid, Value};
use regex_lite::Regex;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number, Value as JsonValue};
use std::sync::OnceLock;
use tracing::error;

const INDENT: &[u8] = b"    ";

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2}):(\d{2})\.(\d{1,9})Z$")
            .expect("time regex is valid")
    })
}

/// Format a [`Time`] with millisecond precision, or nanosecond precision
/// when the sub-millisecond part is not zero.
pub fn format_time(time: Time) -> Option<String> {
    let dt = time.to_datetime()?;
    let formatted = if dt.timestamp_subsec_nanos() % 1_000_000 == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.9fZ")
    };
    Some(formatted.to_string())
}

/// Parse the strict time form. Every component is mandatory.
pub fn parse_time(s: &str) -> Option<Time> {
    let caps = time_pattern().captures(s)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = i32::try_from(num(1)?).ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;

    let fraction = caps.get(7)?.as_str();
    let nanos = fraction.parse::<u32>().ok()? * 10u32.pow(9 - fraction.len() as u32);
    let time = NaiveTime::from_hms_nano_opt(num(4)?, num(5)?, num(6)?, nanos)?;

    Some(Time::from_datetime(date.and_time(time).and_utc()))
}

fn to_json(value: &Value, path: &str) -> CodecResult<JsonValue> {
    Ok(match value {
        Value::Undefined | Value::Null => JsonValue::Null,
        Value::Array(items) => JsonValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| to_json(v, &format!("{path}.{i}")))
                .collect::<CodecResult<_>>()?,
        ),
        Value::BinData(bytes) => JsonValue::String(to_base64_no_lb(bytes)),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Double(d) => JsonValue::Number(
            Number::from_f64(*d)
                .ok_or_else(|| CodecError::invalid_field(path, "non-finite double"))?,
        ),
        Value::Int32(v) => JsonValue::from(*v),
        Value::Int64(v) => JsonValue::from(*v),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Time(t) => JsonValue::String(
            format_time(*t).ok_or_else(|| CodecError::invalid_field(path, "time out of range"))?,
        ),
        Value::Object(object) => JsonValue::Object(
            object
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v, &format!("{path}.{k}"))?)))
                .collect::<CodecResult<_>>()?,
        ),
    })
}

fn number_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        match i32::try_from(i) {
            Ok(narrow) => Value::Int32(narrow),
            Err(_) => Value::Int64(i),
        }
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn from_json(value: JsonValue, path: &str) -> CodecResult<Value> {
    Ok(match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(b),
        JsonValue::Number(n) => number_value(&n),
        JsonValue::String(s) => {
            if is_base64(s.as_bytes()) {
                Value::BinData(from_base64(s.as_bytes()).map_err(|e| match e {
                    CodecError::InvalidField { reason, .. } => CodecError::invalid_field(path, reason),
                    other => other,
                })?)
            } else if let Some(time) = parse_time(&s) {
                Value::Time(time)
            } else {
                Value::String(s)
            }
        }
        JsonValue::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| from_json(v, &format!("{path}.{i}")))
                .collect::<CodecResult<_>>()?,
        ),
        JsonValue::Object(map) => Value::Object(object_from_map(map, path)?),
    })
}

fn object_from_map(map: Map<String, JsonValue>, path: &str) -> CodecResult<Object> {
    map.into_iter()
        .map(|(k, v)| {
            let child = if path.is_empty() {
                k.clone()
            } else {
                format!("{path}.{k}")
            };
            Ok((k, from_json(v, &child)?))
        })
        .collect()
}

/// Convert a parser line/column (both 1-based) into a byte offset.
fn byte_offset(data: &[u8], line: usize, column: usize) -> usize {
    let line_start: usize = data
        .split(|&b| b == b'\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    (line_start + column.saturating_sub(1)).min(data.len())
}

/// Reusable accumulator building one JSON object.
#[derive(Debug, Default)]
pub struct TextSerializer {
    root: Map<String, JsonValue>,
    buffer: Option<Vec<u8>>,
}

impl TextSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.root.clear();
        self.buffer = None;
    }

    /// Append one field; a repeated name replaces the earlier value.
    pub fn append_field(&mut self, name: &str, value: &Value) -> CodecResult<()> {
        if self.buffer.is_some() {
            self.clear();
        }
        let json = to_json(value, name)?;
        self.root.insert(name.to_string(), json);
        Ok(())
    }

    /// Uids are written as signed 64-bit numbers (broadcast is `-1`).
    pub fn append_uid(&mut self, name: &str, uid: Uid) -> CodecResult<()> {
        self.append_field(name, &Value::Int64(uid as i64))
    }

    pub fn append_null(&mut self, name: &str) -> CodecResult<()> {
        self.append_field(name, &Value::Null)
    }

    pub fn append_undefined(&mut self, name: &str) -> CodecResult<()> {
        self.append_field(name, &Value::Undefined)
    }

    /// Close the object and return it pretty-printed with 4-space indent.
    pub fn get_buffer(&mut self) -> Vec<u8> {
        if let Some(buffer) = &self.buffer {
            return buffer.clone();
        }
        let mut out = Vec::with_capacity(128);
        let mut ser =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(INDENT));
        if let Err(e) = self.root.serialize(&mut ser) {
            error!(error = %e, "Failed to write JSON document");
        }
        self.buffer = Some(out.clone());
        out
    }
}

/// Decoder for JSON objects. Parsing stops after the first complete value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDeserializer;

impl TextDeserializer {
    pub fn new() -> Self {
        Self
    }

    pub fn deserialize(&self, data: &[u8]) -> CodecResult<Object> {
        let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<JsonValue>();
        let root = match stream.next() {
            Some(Ok(root)) => root,
            Some(Err(e)) => {
                return Err(CodecError::Malformed {
                    offset: byte_offset(data, e.line(), e.column()),
                    message: format!("Parse failed: {e}"),
                })
            }
            None => {
                return Err(CodecError::Malformed {
                    offset: data.len(),
                    message: "empty document".to_string(),
                })
            }
        };
        match root {
            JsonValue::Object(map) => object_from_map(map, ""),
            other => Err(CodecError::Malformed {
                offset: 0,
                message: format!("root must be an object, found {other}"),
            }),
        }
    }
}

/// [`MessageCodec`] for pretty-printed JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl MessageCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn serialize_message(&self, message: &Message) -> CodecResult<Vec<u8>> {
        let mut serializer = TextSerializer::new();
        for (name, value) in envelope_entries(message) {
            serializer.append_field(name, &value)?;
        }
        Ok(serializer.get_buffer())
    }

    fn deserialize_message(&self, data: &[u8]) -> CodecResult<Message> {
        message_from_object(TextDeserializer.deserialize(data)?)
    }

    fn serialize_object(&self, object: &Object) -> CodecResult<Vec<u8>> {
        let mut serializer = TextSerializer::new();
        for (name, value) in object {
            serializer.append_field(name, value)?;
        }
        Ok(serializer.get_buffer())
    }

    fn deserialize_object(&self, data: &[u8]) -> CodecResult<Object> {
        TextDeserializer.deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use modlink_types::{MessageType, ModuleAddress};

    fn single(value: Value) -> String {
        let mut s = TextSerializer::new();
        s.append_field("test", &value).unwrap();
        String::from_utf8(s.get_buffer()).unwrap()
    }

    fn decode(text: &str) -> Object {
        TextDeserializer.deserialize(text.as_bytes()).unwrap()
    }

    fn sample_time() -> Time {
        Time::from(Utc.with_ymd_and_hms(2017, 10, 1, 18, 52, 23).unwrap())
    }

    #[test]
    fn test_pretty_layout() {
        assert_eq!(single(Value::from("test")), "{\n    \"test\": \"test\"\n}");
        assert_eq!(single(Value::Int32(777)), "{\n    \"test\": 777\n}");
        assert_eq!(single(Value::Double(0.777)), "{\n    \"test\": 0.777\n}");
        assert_eq!(single(Value::Boolean(true)), "{\n    \"test\": true\n}");
        assert_eq!(single(Value::Null), "{\n    \"test\": null\n}");
        assert_eq!(single(Value::Undefined), "{\n    \"test\": null\n}");
    }

    #[test]
    fn test_nested_layout() {
        let mut inner = Object::new();
        inner.insert("a".into(), Value::from("b"));
        inner.insert("b".into(), Value::Int64(-100_000_000_000));
        assert_eq!(
            single(Value::Object(inner)),
            "{\n    \"test\": {\n        \"a\": \"b\",\n        \"b\": -100000000000\n    }\n}"
        );
        assert_eq!(
            single(Value::Array(vec![Value::Int32(1), Value::Int32(2)])),
            "{\n    \"test\": [\n        1,\n        2\n    ]\n}"
        );
    }

    #[test]
    fn test_bindata_uses_sentinel() {
        let text = single(Value::BinData(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(text, "{\n    \"test\": \"BASE64:\\n3q2+7w==\"\n}");
        assert_eq!(
            decode(&text)["test"],
            Value::BinData(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
    }

    #[test]
    fn test_wrapped_base64_decodes() {
        let text = "{\"b\": \"BASE64:\\nc3Nz\\nc3M=\"}";
        assert_eq!(decode(text)["b"], Value::BinData(b"sssss".to_vec()));
    }

    #[test]
    fn test_time_format_and_parse() {
        let text = single(Value::Time(sample_time()));
        assert_eq!(text, "{\n    \"test\": \"2017-10-01T18:52:23.000Z\"\n}");
        assert_eq!(decode(&text)["test"], Value::Time(sample_time()));

        let precise = Time::from_nanos(sample_time().as_nanos() + 123_456_789);
        assert_eq!(format_time(precise).unwrap(), "2017-10-01T18:52:23.123456789Z");
        assert_eq!(parse_time("2017-10-01T18:52:23.123456789Z"), Some(precise));
    }

    #[test]
    fn test_parse_time_single_digit_fraction() {
        assert_eq!(parse_time("2017-10-01T18:52:23.0Z"), Some(sample_time()));
        let half = Time::from_nanos(sample_time().as_nanos() + 500_000_000);
        assert_eq!(parse_time("2017-10-01T18:52:23.5Z"), Some(half));
    }

    #[test]
    fn test_time_detection_is_strict() {
        for s in [
            "2017-10-01T18:52:23Z",
            "2017-10-01T18:52Z",
            "2017-10-01 18:52:23.000Z",
            "2017-10-01T18:52:23.000",
            "17-10-01T18:52:23.000Z",
            "2017-13-01T18:52:23.000Z",
            "2017-02-30T18:52:23.000Z",
            "2017-10-01T25:52:23.000Z",
            "2017-10-01T18:52:23.1234567890Z",
        ] {
            let text = format!("{{\"t\": \"{s}\"}}");
            assert_eq!(decode(&text)["t"], Value::from(s), "{s} parsed as time");
        }
    }

    #[test]
    fn test_narrowest_number() {
        let object = decode(
            r#"{"small": 1, "neg": -2147483649, "big": 3000000000, "float": 1.5,
                "whole_float": 2.0, "huge": 18446744073709551615}"#,
        );
        assert_eq!(object["small"], Value::Int32(1));
        assert_eq!(object["neg"], Value::Int64(-2_147_483_649));
        assert_eq!(object["big"], Value::Int64(3_000_000_000));
        assert_eq!(object["float"], Value::Double(1.5));
        assert_eq!(object["whole_float"], Value::Double(2.0));
        assert_eq!(object["huge"], Value::Double(18_446_744_073_709_551_615.0));
    }

    #[test]
    fn test_int64_widening_keeps_magnitude() {
        let codec = TextCodec;
        let mut object = Object::new();
        object.insert("a".into(), Value::Int64(5));
        object.insert("b".into(), Value::Int32(-5));
        let back = codec
            .deserialize_object(&codec.serialize_object(&object).unwrap())
            .unwrap();
        assert_eq!(back["a"], Value::Int32(5));
        assert_eq!(back["b"], Value::Int32(-5));
    }

    #[test]
    fn test_non_finite_double_rejected() {
        let mut s = TextSerializer::new();
        let err = s.append_field("x", &Value::Double(f64::NAN)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { ref path, .. } if path == "x"));
    }

    #[test]
    fn test_malformed_reports_offset() {
        let input = b"{\n  \"a\": 1,\n  \"b\": ]\n}";
        let err = TextDeserializer.deserialize(input).unwrap_err();
        match err {
            CodecError::Malformed { offset, .. } => {
                assert!(offset > 10 && offset <= input.len(), "offset {offset}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_object_root_rejected() {
        assert!(matches!(
            TextDeserializer.deserialize(b"[1, 2]").unwrap_err(),
            CodecError::Malformed { .. }
        ));
        assert!(matches!(
            TextDeserializer.deserialize(b"   ").unwrap_err(),
            CodecError::Malformed { .. }
        ));
    }

    #[test]
    fn test_stops_after_first_value() {
        let object = decode("{\"a\": 1} trailing");
        assert_eq!(object["a"], Value::Int32(1));
    }

    #[test]
    fn test_duplicate_field_replaced() {
        let mut s = TextSerializer::new();
        s.append_field("a", &Value::Int32(1)).unwrap();
        s.append_field("a", &Value::Int32(2)).unwrap();
        assert_eq!(String::from_utf8(s.get_buffer()).unwrap(), "{\n    \"a\": 2\n}");
    }

    #[test]
    fn test_append_after_get_buffer_starts_fresh() {
        let mut s = TextSerializer::new();
        s.append_field("first", &Value::Int32(1)).unwrap();
        let first = s.get_buffer();
        assert_eq!(s.get_buffer(), first);
        s.append_uid("second", 7).unwrap();
        let object = decode(&String::from_utf8(s.get_buffer()).unwrap());
        assert_eq!(object.len(), 1);
        assert_eq!(object["second"], Value::Int32(7));
    }

    #[test]
    fn test_message_roundtrip() {
        let mut fields = Object::new();
        fields.insert("name".into(), Value::from("do_thing"));
        fields.insert("flag".into(), Value::Boolean(false));
        let message = Message::to_uid(MessageType::Action, fields, 4242)
            .with_sender(ModuleAddress::new(99, "alpha", "worker"));

        let codec = TextCodec;
        let bytes = codec.serialize_message(&message).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("{\n    \"type\": 0,\n    \"sender_m_uid\": 99,"));

        let decoded = codec.deserialize_message(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_broadcast_message_roundtrip() {
        let message = Message::new(MessageType::EchoRequest, Object::new());
        let codec = TextCodec;
        let decoded = codec
            .deserialize_message(&codec.serialize_message(&message).unwrap())
            .unwrap();
        assert!(decoded.is_broadcast());
        assert!(decoded.sender().is_broadcast());
        assert_eq!(decoded.created(), message.created());
    }
}
