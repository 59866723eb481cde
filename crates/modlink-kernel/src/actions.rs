//! Named facade over the action registry.

use crate::activity::{Action, HandlerToken};
use crate::controller::Controller;
use crate::error::KernelResult;
use modlink_types::{EAMetadata, Module, ModuleAddress, ModuleRegistry, Object, Uid};
use modlink_wire::Bus;
use std::sync::Arc;

/// Announces a module's actions, triggers other modules' actions and runs
/// handlers for the ones this process implements.
#[derive(Clone)]
pub struct ActionController {
    inner: Arc<Controller<Action>>,
}

impl ActionController {
    pub fn new(bus: Bus, modules: Option<ModuleRegistry>) -> Self {
        Self {
            inner: Controller::new(bus, modules),
        }
    }

    /// The underlying generic registry.
    pub fn controller(&self) -> &Arc<Controller<Action>> {
        &self.inner
    }

    pub async fn announce_actions(
        &self,
        module: &Arc<Module>,
        actions: Vec<EAMetadata>,
    ) -> KernelResult<()> {
        self.inner.announce(module, actions).await
    }

    pub async fn announce_action(
        &self,
        module: &Arc<Module>,
        action: EAMetadata,
    ) -> KernelResult<()> {
        self.inner.announce(module, vec![action]).await
    }

    pub async fn denounce_actions(&self, module: Uid, names: Vec<String>) -> KernelResult<()> {
        self.inner.denounce(module, names).await
    }

    pub async fn denounce_action(&self, module: Uid, name: &str) -> KernelResult<()> {
        self.inner.denounce(module, vec![name.to_string()]).await
    }

    /// Actions of `module`, or of every module for `None`. Queries the bus.
    pub async fn get_actions(&self, module: Option<Uid>) -> Vec<Arc<EAMetadata>> {
        self.inner.get_metadata(module).await
    }

    /// Ask `module` to perform action `name`.
    pub async fn activate_action(
        &self,
        module: Uid,
        name: &str,
        fields: Object,
    ) -> KernelResult<()> {
        self.inner.generate_activity(module, name, fields).await
    }

    pub fn register_action_handler<F>(
        &self,
        module: Uid,
        name: &str,
        handler: F,
    ) -> KernelResult<HandlerToken>
    where
        F: Fn(&ModuleAddress, &Action) -> bool + Send + Sync + 'static,
    {
        self.inner.register_handler(module, name, handler)
    }

    pub fn unregister_action_handler(&self, module: Uid, name: &str, token: HandlerToken) -> bool {
        self.inner.unregister_handler(module, name, token)
    }
}
