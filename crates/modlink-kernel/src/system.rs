//! The per-process entry point: one bus, one module registry and the two
//! activity controllers, wired together.

use crate::actions::ActionController;
use crate::error::{KernelError, KernelResult};
use crate::events::EventController;
use modlink_types::{BusConfig, MessageType, Module, ModuleRegistry, Object, Value, BROADCAST_UID};
use modlink_wire::Bus;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Everything a module process needs to join the bus.
pub struct System {
    bus: Bus,
    modules: ModuleRegistry,
    actions: ActionController,
    events: EventController,
    me: RwLock<Option<Arc<Module>>>,
}

impl System {
    /// Build an inactive system from configuration.
    pub fn new(config: BusConfig) -> KernelResult<Self> {
        Ok(Self::with_bus(Bus::new(config)?))
    }

    /// Build a system around an existing (possibly active) bus.
    pub fn with_bus(bus: Bus) -> Self {
        let modules = ModuleRegistry::new();
        Self {
            actions: ActionController::new(bus.clone(), Some(modules.clone())),
            events: EventController::new(bus.clone(), Some(modules.clone())),
            bus,
            modules,
            me: RwLock::new(None),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn actions(&self) -> &ActionController {
        &self.actions
    }

    pub fn events(&self) -> &EventController {
        &self.events
    }

    /// The module registered with [`register_me`](Self::register_me).
    pub fn me(&self) -> Option<Arc<Module>> {
        self.me.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn activate(&self) -> KernelResult<()> {
        self.bus.activate().await?;
        Ok(())
    }

    pub async fn deactivate(&self) {
        self.bus.deactivate().await;
    }

    /// Register `module` as this process's identity on the bus.
    ///
    /// With `announce`, an `IntegrateModule` notification is broadcast; a
    /// failed broadcast is returned after the module is registered.
    pub async fn register_me(&self, module: Module, announce: bool) -> KernelResult<Arc<Module>> {
        if let Some(current) = self.me() {
            if current.uid != module.uid {
                return Err(KernelError::Config(format!(
                    "process already registered as module {} ({})",
                    current.uid, current.name
                )));
            }
        }

        let module = self.modules.register(module);
        self.bus.set_identity(module.address());
        *self.me.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&module));
        info!(uid = module.uid, name = %module.name, "Module registered");

        if announce {
            let mut fields = Object::new();
            fields.insert("name".into(), Value::from(module.name.as_str()));
            fields.insert("version".into(), Value::from(module.version.as_str()));
            fields.insert("class".into(), Value::from(module.class()));
            fields.insert("description".into(), Value::from(module.description.as_str()));
            self.bus
                .send_fields(
                    MessageType::IntegrateModule,
                    fields,
                    BROADCAST_UID,
                    self.bus.config().send_timeout_ms,
                )
                .await?;
        }
        Ok(module)
    }

    /// Withdraw this process's module: denounce its actions and events,
    /// broadcast `DesintegrateModule` and drop it from the registry.
    ///
    /// Every step runs even if an earlier send fails; the first failure is
    /// returned. Metadata that referenced the module no longer resolves it.
    pub async fn unregister_me(&self) -> KernelResult<()> {
        let Some(module) = self.me.write().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };
        let uid = module.uid;
        let mut first_error = None;

        let actions = self.actions.controller().local_names(uid);
        if !actions.is_empty() {
            if let Err(e) = self.actions.denounce_actions(uid, actions).await {
                warn!(uid, error = %e, "Failed to denounce actions");
                first_error.get_or_insert(e);
            }
        }
        let events = self.events.controller().local_names(uid);
        if !events.is_empty() {
            if let Err(e) = self.events.denounce_events(uid, events).await {
                warn!(uid, error = %e, "Failed to denounce events");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self
            .bus
            .send_fields(
                MessageType::DesintegrateModule,
                Object::new(),
                BROADCAST_UID,
                self.bus.config().send_timeout_ms,
            )
            .await
        {
            warn!(uid, error = %e, "Failed to broadcast module departure");
            first_error.get_or_insert(KernelError::from(e));
        }

        self.modules.unregister(uid);
        info!(uid, name = %module.name, "Module unregistered");
        drop(module);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
