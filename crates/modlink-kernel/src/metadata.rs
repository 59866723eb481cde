//! Encoding of activity metadata inside announce and reply messages.
//!
//! ```text
//! metadata: [
//!   { name, description, linked_module: "<module uid>",
//!     field_scheme: { "<field uid>": { uid: "<field uid>", type: Int32,
//!                                      name, position: Int32, description } } }
//! ]
//! ```
//!
//! Uids travel as decimal strings so they survive the text codec intact.

use modlink_types::{
    CodecError, CodecResult, EAMetadata, FieldHeader, FieldSchema, Object, Uid, Value, ValueType,
};

pub const METADATA: &str = "metadata";
pub const NAME: &str = "name";
pub const DESCRIPTION: &str = "description";
pub const LINKED_MODULE: &str = "linked_module";
pub const FIELD_SCHEME: &str = "field_scheme";
pub const UID: &str = "uid";
pub const TYPE: &str = "type";
pub const POSITION: &str = "position";

pub fn header_to_value(header: &FieldHeader) -> Value {
    let mut object = Object::new();
    object.insert(UID.into(), Value::String(header.uid().to_string()));
    object.insert(TYPE.into(), Value::Int32(header.value_type().ordinal()));
    object.insert(NAME.into(), Value::from(header.name()));
    object.insert(POSITION.into(), Value::Int32(header.position()));
    object.insert(DESCRIPTION.into(), Value::from(header.description()));
    Value::Object(object)
}

pub fn metadata_to_value(metadata: &EAMetadata) -> Value {
    let scheme: Object = metadata
        .field_scheme()
        .iter()
        .map(|(uid, header)| (uid.to_string(), header_to_value(header)))
        .collect();

    let mut object = Object::new();
    object.insert(NAME.into(), Value::from(metadata.name()));
    object.insert(DESCRIPTION.into(), Value::from(metadata.description()));
    object.insert(
        LINKED_MODULE.into(),
        Value::String(metadata.module_uid().to_string()),
    );
    object.insert(FIELD_SCHEME.into(), Value::Object(scheme));
    Value::Object(object)
}

/// The `metadata` array of an announce or reply message.
pub fn metadata_list(entries: &[impl AsRef<EAMetadata>]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|m| metadata_to_value(m.as_ref()))
            .collect(),
    )
}

fn field<'a>(object: &'a Object, path: &str, key: &str) -> CodecResult<&'a Value> {
    object
        .get(key)
        .ok_or_else(|| CodecError::MissingField(format!("{path}.{key}")))
}

fn string_field<'a>(object: &'a Object, path: &str, key: &str) -> CodecResult<&'a str> {
    field(object, path, key)?
        .as_string()
        .map_err(|source| CodecError::FieldType {
            field: format!("{path}.{key}"),
            source,
        })
}

fn int_field(object: &Object, path: &str, key: &str) -> CodecResult<i32> {
    field(object, path, key)?
        .as_int32()
        .map_err(|source| CodecError::FieldType {
            field: format!("{path}.{key}"),
            source,
        })
}

fn uid_field(object: &Object, path: &str, key: &str) -> CodecResult<Uid> {
    let text = string_field(object, path, key)?;
    text.parse::<Uid>().map_err(|_| {
        CodecError::invalid_field(format!("{path}.{key}"), format!("bad uid '{text}'"))
    })
}

pub fn header_from_value(value: &Value, path: &str) -> CodecResult<FieldHeader> {
    let object = value.as_object().map_err(|source| CodecError::FieldType {
        field: path.to_string(),
        source,
    })?;
    let ordinal = int_field(object, path, TYPE)?;
    let value_type = ValueType::from_ordinal(ordinal).ok_or_else(|| {
        CodecError::invalid_field(format!("{path}.{TYPE}"), format!("unknown type {ordinal}"))
    })?;
    Ok(FieldHeader::new(
        uid_field(object, path, UID)?,
        value_type,
        string_field(object, path, NAME)?,
        int_field(object, path, POSITION)?,
        string_field(object, path, DESCRIPTION)?,
    ))
}

/// Decode one metadata entry. Entries without `linked_module` belong to
/// `default_module`.
pub fn metadata_from_value(value: &Value, default_module: Uid) -> CodecResult<EAMetadata> {
    let object = value.as_object().map_err(|source| CodecError::FieldType {
        field: METADATA.to_string(),
        source,
    })?;
    let name = string_field(object, METADATA, NAME)?;
    let path = format!("{METADATA}.{name}");

    let module_uid = if object.contains_key(LINKED_MODULE) {
        uid_field(object, &path, LINKED_MODULE)?
    } else {
        default_module
    };

    let description = match object.get(DESCRIPTION) {
        Some(v) => v.as_string().map_err(|source| CodecError::FieldType {
            field: format!("{path}.{DESCRIPTION}"),
            source,
        })?,
        None => "",
    };

    let mut scheme = FieldSchema::new();
    if let Some(raw) = object.get(FIELD_SCHEME) {
        let raw = raw.as_object().map_err(|source| CodecError::FieldType {
            field: format!("{path}.{FIELD_SCHEME}"),
            source,
        })?;
        for (key, entry) in raw {
            let header = header_from_value(entry, &format!("{path}.{FIELD_SCHEME}.{key}"))?;
            scheme.insert(header.uid(), header);
        }
    }

    Ok(EAMetadata::detached(module_uid, name, description, scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_codec::{BinaryCodec, MessageCodec, TextCodec};
    use modlink_types::{schema_of, Message, MessageType};

    fn sample() -> EAMetadata {
        EAMetadata::detached(
            u64::MAX - 10,
            "grip",
            "Close the gripper",
            schema_of([
                FieldHeader::new(11, ValueType::Double, "force", 0, "Newtons"),
                FieldHeader::new(12, ValueType::Boolean, "slow", 1, ""),
            ]),
        )
    }

    #[test]
    fn test_layout() {
        let value = metadata_to_value(&sample());
        let object = value.as_object().unwrap();
        assert_eq!(
            object[LINKED_MODULE],
            Value::String((u64::MAX - 10).to_string())
        );
        let scheme = object[FIELD_SCHEME].as_object().unwrap();
        let force = scheme["11"].as_object().unwrap();
        assert_eq!(force[UID], Value::from("11"));
        assert_eq!(force[TYPE], Value::Int32(ValueType::Double.ordinal()));
        assert_eq!(force[POSITION], Value::Int32(0));
        assert_eq!(force[NAME], Value::from("force"));
    }

    #[test]
    fn test_survives_both_codecs() {
        let mut fields = Object::new();
        fields.insert(METADATA.into(), metadata_list(&[Box::new(sample())]));
        let message = Message::to_uid(MessageType::AnnounceModuleActions, fields, 5);

        let codecs: [Box<dyn MessageCodec>; 2] =
            [Box::new(BinaryCodec::strict()), Box::new(TextCodec)];
        for codec in codecs {
            let bytes = codec.serialize_message(&message).unwrap();
            let decoded = codec.deserialize_message(&bytes).unwrap();
            let entries = decoded.get_fields()[METADATA].as_array().unwrap();
            let metadata = metadata_from_value(&entries[0], 0).unwrap();
            assert_eq!(metadata, sample(), "{}", codec.name());
        }
    }

    #[test]
    fn test_minimal_entry_uses_default_module() {
        let mut object = Object::new();
        object.insert(NAME.into(), Value::from("ping"));
        let metadata = metadata_from_value(&Value::Object(object), 42).unwrap();
        assert_eq!(metadata.name(), "ping");
        assert_eq!(metadata.module_uid(), 42);
        assert!(metadata.field_scheme().is_empty());
    }

    #[test]
    fn test_bad_entries() {
        assert!(matches!(
            metadata_from_value(&Value::Object(Object::new()), 0),
            Err(CodecError::MissingField(f)) if f == "metadata.name"
        ));
        assert!(matches!(
            metadata_from_value(&Value::from("grip"), 0),
            Err(CodecError::FieldType { .. })
        ));

        let mut value = metadata_to_value(&sample());
        if let Value::Object(object) = &mut value {
            object.insert(LINKED_MODULE.into(), Value::from("not-a-uid"));
        }
        assert!(matches!(
            metadata_from_value(&value, 0),
            Err(CodecError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_unknown_field_type() {
        let mut header = header_to_value(&FieldHeader::new(1, ValueType::Int32, "n", 0, ""));
        if let Value::Object(object) = &mut header {
            object.insert(TYPE.into(), Value::Int32(99));
        }
        assert!(matches!(
            header_from_value(&header, "h"),
            Err(CodecError::InvalidField { path, .. }) if path == "h.type"
        ));
    }
}
