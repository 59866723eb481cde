//! Core types for modlink.
//!
//! This crate holds the data model shared by every other modlink crate:
//! the dynamic [`Value`], field schemas and activity metadata, modules and
//! their registry, the [`Message`] envelope, uid generation and the shared
//! error and configuration types. It performs no I/O.

pub mod config;
pub mod error;
pub mod message;
pub mod module;
pub mod schema;
pub mod uid;
pub mod value;

pub use config::{BusConfig, CodecKind};
pub use error::{CodecError, CodecResult, TypeMismatch};
pub use message::{Message, MessageParts, MessageType, ModuleAddress};
pub use module::{Module, ModuleRegistry};
pub use schema::{schema_of, EAMetadata, FieldHeader, FieldSchema};
pub use uid::{generate_uid, Uid, BROADCAST_UID};
pub use value::{FromValue, Object, Time, Value, ValueType};
