//! Actions and events: the two kinds of activity a module can expose.
//!
//! Both kinds share one registry implementation
//! ([`Controller`](crate::controller::Controller)); the [`Activity`] trait
//! tells it which message types belong to each kind.

use modlink_types::{EAMetadata, FieldSchema, MessageType, ModuleAddress, Object, Value};
use std::fmt;
use std::sync::Arc;

/// Identifies one registered activity handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(pub(crate) u64);

impl fmt::Display for HandlerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Callback run when an activity is triggered. Receives the address of the
/// module that triggered it. The return value is advisory.
pub type ActivityHandler<A> = Arc<dyn Fn(&ModuleAddress, &A) -> bool + Send + Sync>;

/// One occurrence of an action or event: its metadata plus the parameters
/// it was triggered with.
pub trait Activity: Send + Sync + Sized + 'static {
    /// Lowercase kind name, used in logs and list replies.
    const KIND: &'static str;
    /// Message carrying newly available metadata.
    const ANNOUNCE: MessageType;
    /// Message withdrawing metadata by name.
    const DENOUNCE: MessageType;
    /// Request for the metadata a module exposes.
    const LIST: MessageType;
    /// Message that triggers the activity.
    const TRIGGER: MessageType;

    fn new(metadata: Arc<EAMetadata>, fields: Object) -> Self;

    fn metadata(&self) -> &Arc<EAMetadata>;

    fn fields(&self) -> &Object;

    fn name(&self) -> &str {
        self.metadata().name()
    }

    fn description(&self) -> &str {
        self.metadata().description()
    }

    fn field_scheme(&self) -> &FieldSchema {
        self.metadata().field_scheme()
    }

    /// A parameter by name.
    fn field(&self, name: &str) -> Option<&Value> {
        self.fields().get(name)
    }
}

/// A command another module asks this one to perform.
#[derive(Debug, Clone)]
pub struct Action {
    metadata: Arc<EAMetadata>,
    fields: Object,
}

impl Activity for Action {
    const KIND: &'static str = "action";
    const ANNOUNCE: MessageType = MessageType::AnnounceModuleActions;
    const DENOUNCE: MessageType = MessageType::DenounceModuleActions;
    const LIST: MessageType = MessageType::ReceiveActionsList;
    const TRIGGER: MessageType = MessageType::Action;

    fn new(metadata: Arc<EAMetadata>, fields: Object) -> Self {
        Self { metadata, fields }
    }

    fn metadata(&self) -> &Arc<EAMetadata> {
        &self.metadata
    }

    fn fields(&self) -> &Object {
        &self.fields
    }
}

/// Something that happened in a module, delivered to its subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    metadata: Arc<EAMetadata>,
    fields: Object,
}

impl Activity for Event {
    const KIND: &'static str = "event";
    const ANNOUNCE: MessageType = MessageType::AnnounceModuleEvents;
    const DENOUNCE: MessageType = MessageType::DenounceModuleEvents;
    const LIST: MessageType = MessageType::ReceiveEventsList;
    const TRIGGER: MessageType = MessageType::Event;

    fn new(metadata: Arc<EAMetadata>, fields: Object) -> Self {
        Self { metadata, fields }
    }

    fn metadata(&self) -> &Arc<EAMetadata> {
        &self.metadata
    }

    fn fields(&self) -> &Object {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_types::{schema_of, FieldHeader, ValueType};

    fn metadata() -> Arc<EAMetadata> {
        Arc::new(EAMetadata::detached(
            7,
            "move",
            "Move the arm",
            schema_of([FieldHeader::new(1, ValueType::Double, "x", 0, "Target x")]),
        ))
    }

    #[test]
    fn test_activity_accessors() {
        let mut fields = Object::new();
        fields.insert("x".into(), Value::Double(1.5));
        let action = Action::new(metadata(), fields);
        assert_eq!(action.name(), "move");
        assert_eq!(action.description(), "Move the arm");
        assert_eq!(action.field_scheme().len(), 1);
        assert_eq!(action.field("x"), Some(&Value::Double(1.5)));
        assert!(action.field("y").is_none());
    }

    #[test]
    fn test_kinds_use_distinct_messages() {
        assert_eq!(Action::TRIGGER, MessageType::Action);
        assert_eq!(Event::TRIGGER, MessageType::Event);
        assert_ne!(Action::ANNOUNCE, Event::ANNOUNCE);
        assert_ne!(Action::LIST, Event::LIST);
        assert!(Event::TRIGGER.is_notification());
        assert!(!Action::TRIGGER.is_notification());
    }
}
