//! The dynamic value model carried by every message field.
//!
//! [`Value`] is a closed sum type. Its [`ValueType`] ordinals are stable and
//! shared by both wire codecs, so new variants must only ever be appended.

use crate::error::TypeMismatch;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// A field map: the body of an [`Object`](Value::Object) and of every message.
pub type Object = BTreeMap<String, Value>;

/// Stable discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    Undefined = 0,
    Null = 1,
    Array = 2,
    BinData = 3,
    Boolean = 4,
    Double = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Time = 9,
    Object = 10,
}

impl ValueType {
    /// Every type, in ordinal order.
    pub const ALL: [ValueType; 11] = [
        ValueType::Undefined,
        ValueType::Null,
        ValueType::Array,
        ValueType::BinData,
        ValueType::Boolean,
        ValueType::Double,
        ValueType::Int32,
        ValueType::Int64,
        ValueType::String,
        ValueType::Time,
        ValueType::Object,
    ];

    /// Wire ordinal of this type.
    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Look a type up by its wire ordinal.
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Undefined => "undefined",
            ValueType::Null => "null",
            ValueType::Array => "array",
            ValueType::BinData => "bindata",
            ValueType::Boolean => "boolean",
            ValueType::Double => "double",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::String => "string",
            ValueType::Time => "time",
            ValueType::Object => "object",
        };
        f.write_str(name)
    }
}

/// Nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// Convert from a chrono timestamp, saturating outside the i64 range
    /// (roughly years 1677 to 2262).
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        match dt.timestamp_nanos_opt() {
            Some(nanos) => Self(nanos),
            None if dt.timestamp() < 0 => Self(i64::MIN),
            None => Self(i64::MAX),
        }
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(Self::NANOS_PER_SECOND);
        let nanos = self.0.rem_euclid(Self::NANOS_PER_SECOND) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

/// A self-describing datum.
///
/// `Undefined` means "absent or unknown" and is what `Value::default()`
/// produces; `Null` means "explicitly empty".
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Array(Vec<Value>),
    BinData(Vec<u8>),
    Boolean(bool),
    Double(f64),
    Int32(i32),
    Int64(i64),
    String(String),
    Time(Time),
    Object(Object),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Array(_) => ValueType::Array,
            Value::BinData(_) => ValueType::BinData,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::String(_) => ValueType::String,
            Value::Time(_) => ValueType::Time,
            Value::Object(_) => ValueType::Object,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_bindata(&self) -> bool {
        matches!(self, Value::BinData(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    pub fn is_int32(&self) -> bool {
        matches!(self, Value::Int32(_))
    }

    pub fn is_int64(&self) -> bool {
        matches!(self, Value::Int64(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_time(&self) -> bool {
        matches!(self, Value::Time(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    fn mismatch(&self, expected: ValueType) -> TypeMismatch {
        TypeMismatch {
            expected,
            found: self.value_type(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, TypeMismatch> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => Err(other.mismatch(ValueType::Boolean)),
        }
    }

    pub fn as_int32(&self) -> Result<i32, TypeMismatch> {
        match self {
            Value::Int32(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Int32)),
        }
    }

    pub fn as_int64(&self) -> Result<i64, TypeMismatch> {
        match self {
            Value::Int64(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Int64)),
        }
    }

    pub fn as_double(&self) -> Result<f64, TypeMismatch> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Double)),
        }
    }

    pub fn as_string(&self) -> Result<&str, TypeMismatch> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(ValueType::String)),
        }
    }

    pub fn as_bindata(&self) -> Result<&[u8], TypeMismatch> {
        match self {
            Value::BinData(b) => Ok(b),
            other => Err(other.mismatch(ValueType::BinData)),
        }
    }

    pub fn as_time(&self) -> Result<Time, TypeMismatch> {
        match self {
            Value::Time(t) => Ok(*t),
            other => Err(other.mismatch(ValueType::Time)),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], TypeMismatch> {
        match self {
            Value::Array(a) => Ok(a),
            other => Err(other.mismatch(ValueType::Array)),
        }
    }

    pub fn as_object(&self) -> Result<&Object, TypeMismatch> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.mismatch(ValueType::Object)),
        }
    }

    pub fn into_string(self) -> Result<String, TypeMismatch> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(ValueType::String)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Value>, TypeMismatch> {
        match self {
            Value::Array(a) => Ok(a),
            other => Err(other.mismatch(ValueType::Array)),
        }
    }

    pub fn into_object(self) -> Result<Object, TypeMismatch> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.mismatch(ValueType::Object)),
        }
    }

    /// Narrowing cast: fails unless the stored variant is exactly `T`'s.
    pub fn try_as<T: FromValue>(&self) -> Result<T, TypeMismatch> {
        T::from_value(self)
    }

    /// Like [`try_as`](Self::try_as) but never fails.
    pub fn as_optional<T: FromValue>(&self) -> Option<T> {
        T::from_value(self).ok()
    }
}

/// Types a [`Value`] can be narrowed into without coercion.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch>;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_bool()
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_int32()
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_int64()
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_double()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_string().map(str::to_owned)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_bindata().map(<[u8]>::to_vec)
    }
}

impl FromValue for Time {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_time()
    }
}

impl FromValue for Vec<Value> {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_array().map(<[Value]>::to_vec)
    }
}

impl FromValue for Object {
    fn from_value(value: &Value) -> Result<Self, TypeMismatch> {
        value.as_object().cloned()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::BinData(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::BinData(v.to_vec())
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}
