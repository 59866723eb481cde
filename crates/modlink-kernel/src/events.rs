//! Named facade over the event registry.

use crate::activity::{Event, HandlerToken};
use crate::controller::Controller;
use crate::error::KernelResult;
use modlink_types::{EAMetadata, Module, ModuleAddress, ModuleRegistry, Object, Uid};
use modlink_wire::Bus;
use std::sync::Arc;

/// Announces a module's events, emits them and delivers other modules'
/// events to local subscribers.
#[derive(Clone)]
pub struct EventController {
    inner: Arc<Controller<Event>>,
}

impl EventController {
    pub fn new(bus: Bus, modules: Option<ModuleRegistry>) -> Self {
        Self {
            inner: Controller::new(bus, modules),
        }
    }

    /// The underlying generic registry.
    pub fn controller(&self) -> &Arc<Controller<Event>> {
        &self.inner
    }

    pub async fn announce_events(
        &self,
        module: &Arc<Module>,
        events: Vec<EAMetadata>,
    ) -> KernelResult<()> {
        self.inner.announce(module, events).await
    }

    pub async fn announce_event(
        &self,
        module: &Arc<Module>,
        event: EAMetadata,
    ) -> KernelResult<()> {
        self.inner.announce(module, vec![event]).await
    }

    pub async fn denounce_events(&self, module: Uid, names: Vec<String>) -> KernelResult<()> {
        self.inner.denounce(module, names).await
    }

    pub async fn denounce_event(&self, module: Uid, name: &str) -> KernelResult<()> {
        self.inner.denounce(module, vec![name.to_string()]).await
    }

    /// Events of `module`, or of every module for `None`. Queries the bus.
    pub async fn get_events(&self, module: Option<Uid>) -> Vec<Arc<EAMetadata>> {
        self.inner.get_metadata(module).await
    }

    /// Emit event `name` on behalf of `module`.
    pub async fn generate_event(
        &self,
        module: Uid,
        name: &str,
        fields: Object,
    ) -> KernelResult<()> {
        self.inner.generate_activity(module, name, fields).await
    }

    /// Run `handler` whenever `module` emits `name`. The event must be known,
    /// either announced locally or learned through [`get_events`](Self::get_events).
    pub fn subscribe<F>(&self, module: Uid, name: &str, handler: F) -> KernelResult<HandlerToken>
    where
        F: Fn(&ModuleAddress, &Event) -> bool + Send + Sync + 'static,
    {
        self.inner.register_handler(module, name, handler)
    }

    pub fn unsubscribe(&self, module: Uid, name: &str, token: HandlerToken) -> bool {
        self.inner.unregister_handler(module, name, token)
    }
}
