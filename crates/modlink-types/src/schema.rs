//! Field schemas and action/event metadata.

use crate::module::Module;
use crate::uid::Uid;
use crate::value::ValueType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// One field of an activity's parameter schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldHeader {
    uid: Uid,
    value_type: ValueType,
    name: String,
    position: i32,
    description: String,
}

impl FieldHeader {
    pub fn new(
        uid: Uid,
        value_type: ValueType,
        name: impl Into<String>,
        position: i32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            uid,
            value_type,
            name: name.into(),
            position,
            description: description.into(),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Field uid → header.
pub type FieldSchema = BTreeMap<Uid, FieldHeader>;

/// Build a schema from headers, keyed by their uids.
pub fn schema_of(headers: impl IntoIterator<Item = FieldHeader>) -> FieldSchema {
    headers.into_iter().map(|h| (h.uid(), h)).collect()
}

/// Description of a single action or event.
///
/// The owning module is referenced weakly: metadata learned from a remote
/// peer, or outliving an unregistered module, simply has no linked module.
#[derive(Clone)]
pub struct EAMetadata {
    name: String,
    description: String,
    field_scheme: FieldSchema,
    module_uid: Uid,
    module: Weak<Module>,
}

impl EAMetadata {
    /// Metadata owned by a locally registered module.
    pub fn new(
        module: &Arc<Module>,
        name: impl Into<String>,
        description: impl Into<String>,
        field_scheme: FieldSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            field_scheme,
            module_uid: module.uid,
            module: Arc::downgrade(module),
        }
    }

    /// Metadata for a module this process only knows by uid.
    pub fn detached(
        module_uid: Uid,
        name: impl Into<String>,
        description: impl Into<String>,
        field_scheme: FieldSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            field_scheme,
            module_uid,
            module: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn field_scheme(&self) -> &FieldSchema {
        &self.field_scheme
    }

    pub fn module_uid(&self) -> Uid {
        self.module_uid
    }

    /// The owning module, if it is still registered.
    pub fn linked_module(&self) -> Option<Arc<Module>> {
        self.module.upgrade()
    }

    /// Re-point the back-reference, e.g. after the owner registers locally.
    pub fn link(&mut self, module: &Arc<Module>) {
        self.module_uid = module.uid;
        self.module = Arc::downgrade(module);
    }
}

impl PartialEq for EAMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.field_scheme == other.field_scheme
            && self.module_uid == other.module_uid
    }
}

impl fmt::Debug for EAMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EAMetadata")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("field_scheme", &self.field_scheme)
            .field("module_uid", &self.module_uid)
            .field("linked", &(self.module.strong_count() > 0))
            .finish()
    }
}
