//! The addressed, timestamped message envelope.

use crate::uid::{Uid, BROADCAST_UID};
use crate::value::{Object, Time};
use std::fmt;

/// Kinds of bus traffic. The ordinals are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum MessageType {
    Action = 0,
    AnnounceModuleActions = 1,
    AnnounceModuleEvents = 2,
    DenounceModuleActions = 3,
    DenounceModuleEvents = 4,
    DesintegrateModule = 5,
    EchoReply = 6,
    EchoRequest = 7,
    Error = 8,
    Event = 9,
    IntegrateModule = 10,
    ReceiveActionsList = 11,
    ReceiveEventsList = 12,
    Reply = 13,
    SubscribeToEvents = 14,
    SystemStarted = 15,
    UnsubscribeFromEvents = 16,
}

impl MessageType {
    /// Every message type, in ordinal order.
    pub const ALL: [MessageType; 17] = [
        MessageType::Action,
        MessageType::AnnounceModuleActions,
        MessageType::AnnounceModuleEvents,
        MessageType::DenounceModuleActions,
        MessageType::DenounceModuleEvents,
        MessageType::DesintegrateModule,
        MessageType::EchoReply,
        MessageType::EchoRequest,
        MessageType::Error,
        MessageType::Event,
        MessageType::IntegrateModule,
        MessageType::ReceiveActionsList,
        MessageType::ReceiveEventsList,
        MessageType::Reply,
        MessageType::SubscribeToEvents,
        MessageType::SystemStarted,
        MessageType::UnsubscribeFromEvents,
    ];

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Traffic every peer may care about, whatever its receiver field says.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            MessageType::AnnounceModuleActions
                | MessageType::AnnounceModuleEvents
                | MessageType::DenounceModuleActions
                | MessageType::DenounceModuleEvents
                | MessageType::DesintegrateModule
                | MessageType::Event
                | MessageType::IntegrateModule
                | MessageType::SubscribeToEvents
                | MessageType::SystemStarted
                | MessageType::UnsubscribeFromEvents
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `(uid, name, class)` of a message endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleAddress {
    pub uid: Uid,
    pub name: String,
    pub class: String,
}

impl ModuleAddress {
    pub fn new(uid: Uid, name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            uid,
            name: name.into(),
            class: class.into(),
        }
    }

    /// The "everyone" address: broadcast uid, empty name and class.
    pub fn broadcast() -> Self {
        Self::new(BROADCAST_UID, "", "")
    }

    pub fn is_broadcast(&self) -> bool {
        self.uid == BROADCAST_UID && self.name.is_empty()
    }
}

impl Default for ModuleAddress {
    fn default() -> Self {
        Self::broadcast()
    }
}

/// Every field of a [`Message`], for reconstruction from the wire.
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub kind: MessageType,
    pub sender: ModuleAddress,
    pub receiver: ModuleAddress,
    pub created: Time,
    pub fields: Object,
}

/// An immutable envelope around a field map.
///
/// Only the sender triple can change after construction, through
/// [`with_sender`](Message::with_sender), which the transport uses to stamp
/// its local identity onto outgoing messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageType,
    sender: ModuleAddress,
    receiver: ModuleAddress,
    created: Time,
    fields: Object,
}

impl Message {
    /// A broadcast message.
    pub fn new(kind: MessageType, fields: Object) -> Self {
        Self::addressed(kind, fields, ModuleAddress::broadcast())
    }

    /// A message for the module with `uid`.
    pub fn to_uid(kind: MessageType, fields: Object, uid: Uid) -> Self {
        Self::addressed(kind, fields, ModuleAddress::new(uid, "", ""))
    }

    /// A message for the module called `name`.
    pub fn to_name(kind: MessageType, fields: Object, name: impl Into<String>) -> Self {
        Self::addressed(kind, fields, ModuleAddress::new(BROADCAST_UID, name, ""))
    }

    fn addressed(kind: MessageType, fields: Object, receiver: ModuleAddress) -> Self {
        Self {
            kind,
            sender: ModuleAddress::broadcast(),
            receiver,
            created: Time::now(),
            fields,
        }
    }

    /// Rebuild a message with explicit sender and creation time.
    pub fn from_parts(parts: MessageParts) -> Self {
        Self {
            kind: parts.kind,
            sender: parts.sender,
            receiver: parts.receiver,
            created: parts.created,
            fields: parts.fields,
        }
    }

    pub fn into_parts(self) -> MessageParts {
        MessageParts {
            kind: self.kind,
            sender: self.sender,
            receiver: self.receiver,
            created: self.created,
            fields: self.fields,
        }
    }

    pub fn with_sender(mut self, sender: ModuleAddress) -> Self {
        self.sender = sender;
        self
    }

    pub fn get_type(&self) -> MessageType {
        self.kind
    }

    pub fn sender(&self) -> &ModuleAddress {
        &self.sender
    }

    pub fn receiver(&self) -> &ModuleAddress {
        &self.receiver
    }

    pub fn created(&self) -> Time {
        self.created
    }

    pub fn get_fields(&self) -> &Object {
        &self.fields
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_broadcast()
    }
}
