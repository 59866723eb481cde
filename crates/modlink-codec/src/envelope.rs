//! The fixed field layout both codecs use for message envelopes.

use modlink_types::{
    CodecError, CodecResult, Message, MessageParts, MessageType, ModuleAddress, Object, Time,
    TypeMismatch, Value, ValueType,
};

pub const TYPE: &str = "type";
pub const SENDER_UID: &str = "sender_m_uid";
pub const SENDER_NAME: &str = "sender_m_name";
pub const SENDER_CLASS: &str = "sender_m_class";
pub const RECEIVER_UID: &str = "receiver_m_uid";
pub const RECEIVER_NAME: &str = "receiver_m_name";
pub const RECEIVER_CLASS: &str = "receiver_m_class";
pub const CREATED: &str = "c_time";
pub const FIELDS: &str = "fields";

/// Envelope entries in wire order.
pub fn envelope_entries(message: &Message) -> [(&'static str, Value); 9] {
    let sender = message.sender();
    let receiver = message.receiver();
    [
        (TYPE, Value::Int32(message.get_type().ordinal())),
        (SENDER_UID, Value::Int64(sender.uid as i64)),
        (SENDER_NAME, Value::from(sender.name.as_str())),
        (SENDER_CLASS, Value::from(sender.class.as_str())),
        (RECEIVER_UID, Value::Int64(receiver.uid as i64)),
        (RECEIVER_NAME, Value::from(receiver.name.as_str())),
        (RECEIVER_CLASS, Value::from(receiver.class.as_str())),
        (CREATED, Value::Time(message.created())),
        (FIELDS, Value::Object(message.get_fields().clone())),
    ]
}

fn take(object: &mut Object, field: &str) -> CodecResult<Value> {
    object
        .remove(field)
        .ok_or_else(|| CodecError::MissingField(field.to_string()))
}

fn field_type(field: &str, source: TypeMismatch) -> CodecError {
    CodecError::FieldType {
        field: field.to_string(),
        source,
    }
}

/// Integers may arrive narrowed to Int32 by the text codec.
fn take_integer(object: &mut Object, field: &str) -> CodecResult<i64> {
    match take(object, field)? {
        Value::Int64(v) => Ok(v),
        Value::Int32(v) => Ok(i64::from(v)),
        other => Err(field_type(
            field,
            TypeMismatch {
                expected: ValueType::Int64,
                found: other.value_type(),
            },
        )),
    }
}

fn take_string(object: &mut Object, field: &str) -> CodecResult<String> {
    take(object, field)?
        .into_string()
        .map_err(|e| field_type(field, e))
}

fn take_address(
    object: &mut Object,
    uid: &str,
    name: &str,
    class: &str,
) -> CodecResult<ModuleAddress> {
    Ok(ModuleAddress {
        uid: take_integer(object, uid)? as u64,
        name: take_string(object, name)?,
        class: take_string(object, class)?,
    })
}

/// Rebuild a [`Message`] from a decoded envelope object.
pub fn message_from_object(mut object: Object) -> CodecResult<Message> {
    let ordinal = take_integer(&mut object, TYPE)?;
    let kind = i32::try_from(ordinal)
        .ok()
        .and_then(MessageType::from_ordinal)
        .ok_or(CodecError::UnknownMessageType(
            i32::try_from(ordinal).unwrap_or(i32::MAX),
        ))?;

    let sender = take_address(&mut object, SENDER_UID, SENDER_NAME, SENDER_CLASS)?;
    let receiver = take_address(&mut object, RECEIVER_UID, RECEIVER_NAME, RECEIVER_CLASS)?;

    let created = match take(&mut object, CREATED)? {
        Value::Time(t) => t,
        Value::Int64(nanos) => Time::from_nanos(nanos),
        other => {
            return Err(field_type(
                CREATED,
                TypeMismatch {
                    expected: ValueType::Time,
                    found: other.value_type(),
                },
            ))
        }
    };

    let fields = take(&mut object, FIELDS)?
        .into_object()
        .map_err(|e| field_type(FIELDS, e))?;

    Ok(Message::from_parts(MessageParts {
        kind,
        sender,
        receiver,
        created,
        fields,
    }))
}
