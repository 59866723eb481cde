//! Modules and the registry that owns them.
//!
//! The [`ModuleRegistry`] is the single owner of [`Module`] values. Everything
//! else (activity metadata in particular) holds a `Weak<Module>` that stops
//! resolving once the module is unregistered.

use crate::message::ModuleAddress;
use crate::uid::Uid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// An addressable unit owning zero or more actions and events.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Unique module id.
    pub uid: Uid,
    /// Filesystem location of the module package.
    pub path: PathBuf,
    /// Module name.
    pub name: String,
    /// Module version string.
    pub version: String,
    /// Classes the module declares. The first one is its addressing class.
    pub classes: Vec<String>,
    /// Names of modules this one depends on.
    pub dependencies: Vec<String>,
    pub description: String,
    pub author: String,
    pub license: String,
    pub homepage: String,
}

impl Module {
    pub fn new(uid: Uid, name: impl Into<String>) -> Self {
        Self {
            uid,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The class used when addressing this module on the bus.
    pub fn class(&self) -> &str {
        self.classes.first().map(String::as_str).unwrap_or_default()
    }

    /// The `(uid, name, class)` triple for message envelopes.
    pub fn address(&self) -> ModuleAddress {
        ModuleAddress::new(self.uid, self.name.clone(), self.class())
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.name == other.name
            && self.path == other.path
            && self.author == other.author
    }
}

impl Eq for Module {}

/// Thread-safe registry of known modules.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    modules: Arc<RwLock<HashMap<Uid, Arc<Module>>>>,
}

impl ModuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            modules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or replace a module, returning the shared handle.
    pub fn register(&self, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        modules.insert(module.uid, Arc::clone(&module));
        module
    }

    /// Remove a module. Weak handles to it stop resolving once the caller
    /// drops the returned value.
    pub fn unregister(&self, uid: Uid) -> Option<Arc<Module>> {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        modules.remove(&uid)
    }

    pub fn get(&self, uid: Uid) -> Option<Arc<Module>> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules.get(&uid).cloned()
    }

    /// All modules with the given name (names are not unique across versions).
    pub fn find_by_name(&self, name: &str) -> Vec<Arc<Module>> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules
            .values()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Module>> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_module(uid: Uid, name: &str) -> Module {
        Module::new(uid, name)
            .with_path(format!("/opt/modules/{name}"))
            .with_version("1.0.0")
            .with_class("worker")
            .with_author("dev")
    }

    #[test]
    fn test_module_equality_ignores_descriptive_fields() {
        let a = make_module(1, "alpha");
        let b = make_module(1, "alpha")
            .with_version("2.0.0")
            .with_description("changed");
        assert_eq!(a, b);
        assert_ne!(a, make_module(2, "alpha"));
        assert_ne!(a, make_module(1, "alpha").with_author("someone else"));
    }

    #[test]
    fn test_module_address() {
        let m = make_module(9, "alpha");
        let addr = m.address();
        assert_eq!(addr.uid, 9);
        assert_eq!(addr.name, "alpha");
        assert_eq!(addr.class, "worker");
        assert_eq!(Module::new(3, "bare").class(), "");
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = ModuleRegistry::new();
        assert!(registry.is_empty());
        let handle = registry.register(make_module(1, "alpha"));
        registry.register(make_module(2, "beta"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().name, "alpha");
        assert_eq!(registry.find_by_name("beta").len(), 1);

        let weak = Arc::downgrade(&handle);
        drop(handle);
        assert!(weak.upgrade().is_some());

        let removed = registry.unregister(1);
        assert!(removed.is_some());
        drop(removed);
        assert!(weak.upgrade().is_none());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.all().len(), 1);
    }
}
