//! Generic capability registry shared by actions and events.
//!
//! A [`Controller`] keeps a two-level map `module uid → activity name →
//! registration`. Local registrations come from [`Controller::announce`];
//! remote ones are cached from announce and reply messages seen on the bus.
//! Handlers can be attached to either: a module handles its own actions, and
//! subscribes to other modules' events.
//!
//! The controller hooks itself into the bus at construction and unhooks on
//! drop. Hooks run on the bus reader task, so they only touch the registry
//! briefly and never await.

use crate::activity::{Activity, ActivityHandler, HandlerToken};
use crate::error::{KernelError, KernelResult};
use crate::metadata::{metadata_from_value, metadata_list, METADATA, NAME};

use dashmap::DashMap;
use modlink_types::{
    EAMetadata, Message, MessageType, Module, ModuleAddress, ModuleRegistry, Object, Uid, Value,
    BROADCAST_UID,
};
use modlink_wire::{Bus, HandlerId};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Correlates a list request with its replies.
pub const REQUEST_ID: &str = "request_id";
/// Which activity kind a list request or reply concerns.
pub const ACTIVITY: &str = "activity";

struct Registration<A: Activity> {
    metadata: Arc<EAMetadata>,
    handlers: Vec<(HandlerToken, ActivityHandler<A>)>,
    /// Announced by this process (as opposed to learned from a peer).
    local: bool,
}

impl<A: Activity> Registration<A> {
    fn new(metadata: Arc<EAMetadata>, local: bool) -> Self {
        Self {
            metadata,
            handlers: Vec::new(),
            local,
        }
    }
}

type Registry<A> = HashMap<Uid, BTreeMap<String, Registration<A>>>;

/// Registry and bus glue for one activity kind.
pub struct Controller<A: Activity> {
    bus: Bus,
    modules: Option<ModuleRegistry>,
    registry: RwLock<Registry<A>>,
    pending: DashMap<String, mpsc::UnboundedSender<()>>,
    next_token: AtomicU64,
    hooks: Vec<HandlerId>,
    _kind: PhantomData<fn() -> A>,
}

impl<A: Activity> Controller<A> {
    /// Create a controller and hook it into `bus`.
    ///
    /// With a module registry, metadata learned from peers is linked to the
    /// matching local [`Module`] when there is one.
    pub fn new(bus: Bus, modules: Option<ModuleRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut hooks = Vec::new();
            hooks.push(hook(&bus, A::ANNOUNCE, weak, Self::on_announce));
            hooks.push(hook(&bus, A::DENOUNCE, weak, Self::on_denounce));
            hooks.push(hook(&bus, A::TRIGGER, weak, Self::on_trigger));
            hooks.push(hook(&bus, A::LIST, weak, Self::on_list_request));
            hooks.push(hook(&bus, MessageType::Reply, weak, Self::on_reply));
            hooks.push(hook(
                &bus,
                MessageType::DesintegrateModule,
                weak,
                Self::on_desintegrate,
            ));
            Self {
                bus,
                modules,
                registry: RwLock::new(HashMap::new()),
                pending: DashMap::new(),
                next_token: AtomicU64::new(1),
                hooks,
                _kind: PhantomData,
            }
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn send_timeout(&self) -> i64 {
        self.bus.config().send_timeout_ms
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Register `metadata` as activities of `module` and tell the bus.
    ///
    /// An entry with the same name is replaced; its handlers are kept.
    pub async fn announce(
        &self,
        module: &Arc<Module>,
        metadata: Vec<EAMetadata>,
    ) -> KernelResult<()> {
        let announced: Vec<Arc<EAMetadata>> = metadata
            .into_iter()
            .map(|mut m| {
                m.link(module);
                Arc::new(m)
            })
            .collect();
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            let entries = registry.entry(module.uid).or_default();
            for metadata in &announced {
                upsert(entries, Arc::clone(metadata), true);
            }
        }
        info!(
            module = module.uid,
            kind = A::KIND,
            count = announced.len(),
            "Announcing activities"
        );

        let mut fields = Object::new();
        fields.insert(METADATA.into(), metadata_list(&announced));
        self.bus
            .send_fields(A::ANNOUNCE, fields, module.uid, self.send_timeout())
            .await?;
        Ok(())
    }

    /// Withdraw activities of `module` by name and tell the bus.
    pub async fn denounce(&self, module: Uid, names: Vec<String>) -> KernelResult<()> {
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entries) = registry.get_mut(&module) {
                for name in &names {
                    entries.remove(name);
                }
                if entries.is_empty() {
                    registry.remove(&module);
                }
            }
        }
        info!(module, kind = A::KIND, names = ?names, "Denouncing activities");

        let mut fields = Object::new();
        fields.insert(
            METADATA.into(),
            Value::Array(names.into_iter().map(Value::String).collect()),
        );
        self.bus
            .send_fields(A::DENOUNCE, fields, module, self.send_timeout())
            .await?;
        Ok(())
    }

    /// Trigger activity `name` of `module` with `fields` as parameters.
    pub async fn generate_activity(
        &self,
        module: Uid,
        name: &str,
        mut fields: Object,
    ) -> KernelResult<()> {
        fields.insert(NAME.into(), Value::from(name));
        debug!(module, kind = A::KIND, name, "Triggering activity");
        self.bus
            .send_fields(A::TRIGGER, fields, module, self.send_timeout())
            .await?;
        Ok(())
    }

    /// Attach a handler to a known activity.
    pub fn register_handler<F>(
        &self,
        module: Uid,
        name: &str,
        handler: F,
    ) -> KernelResult<HandlerToken>
    where
        F: Fn(&ModuleAddress, &A) -> bool + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let registration = registry
            .get_mut(&module)
            .and_then(|entries| entries.get_mut(name))
            .ok_or_else(|| KernelError::UnknownActivity {
                module,
                name: name.to_string(),
            })?;
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        registration.handlers.push((token, Arc::new(handler)));
        debug!(module, kind = A::KIND, name, %token, "Handler registered");
        Ok(token)
    }

    /// Detach a handler. Returns `false` if it was not attached.
    pub fn unregister_handler(&self, module: Uid, name: &str, token: HandlerToken) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let Some(registration) = registry
            .get_mut(&module)
            .and_then(|entries| entries.get_mut(name))
        else {
            return false;
        };
        let before = registration.handlers.len();
        registration.handlers.retain(|(t, _)| *t != token);
        registration.handlers.len() != before
    }

    pub fn handler_count(&self, module: Uid, name: &str) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module)
            .and_then(|entries| entries.get(name))
            .map_or(0, |r| r.handlers.len())
    }

    /// Run every handler of `(module, name)` in registration order.
    ///
    /// Returns how many handlers ran. Handler results do not stop the others.
    pub fn run_handlers(
        &self,
        module: Uid,
        name: &str,
        params: Object,
        origin: &ModuleAddress,
    ) -> usize {
        let (metadata, handlers) = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            let Some(registration) = registry.get(&module).and_then(|e| e.get(name)) else {
                debug!(module, kind = A::KIND, name, "No such activity, ignoring trigger");
                return 0;
            };
            let handlers: Vec<ActivityHandler<A>> = registration
                .handlers
                .iter()
                .map(|(_, h)| Arc::clone(h))
                .collect();
            (Arc::clone(&registration.metadata), handlers)
        };

        let activity = A::new(metadata, params);
        for handler in &handlers {
            if !handler(origin, &activity) {
                trace!(module, kind = A::KIND, name, "Handler declined activity");
            }
        }
        handlers.len()
    }

    /// Metadata already known for `module` (all modules for `None`),
    /// without asking the bus.
    pub fn cached_metadata(&self, module: Option<Uid>) -> Vec<Arc<EAMetadata>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        match module {
            Some(uid) => registry
                .get(&uid)
                .map(|entries| entries.values().map(|r| Arc::clone(&r.metadata)).collect())
                .unwrap_or_default(),
            None => registry
                .values()
                .flat_map(|entries| entries.values().map(|r| Arc::clone(&r.metadata)))
                .collect(),
        }
    }

    fn local_metadata(&self, module: Option<Uid>) -> Vec<Arc<EAMetadata>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .filter(|(uid, _)| module.map_or(true, |m| m == **uid))
            .flat_map(|(_, entries)| entries.values())
            .filter(|r| r.local)
            .map(|r| Arc::clone(&r.metadata))
            .collect()
    }

    /// Names of the activities `module` announced from this process.
    pub fn local_names(&self, module: Uid) -> Vec<String> {
        self.local_metadata(Some(module))
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Remote query
    // -----------------------------------------------------------------------

    /// Ask the bus for the activities of `module` (every module for `None`)
    /// and return what is known once the answer arrives.
    ///
    /// Waits at most `query_timeout_ms`; when the request cannot be sent or
    /// nobody answers, the cache is returned as is. A module nobody knows
    /// yields an empty list.
    pub async fn get_metadata(&self, module: Option<Uid>) -> Vec<Arc<EAMetadata>> {
        if let Some(uid) = module {
            let local = self.local_metadata(Some(uid));
            if !local.is_empty() {
                return local;
            }
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(request_id.clone(), tx);

        let mut fields = Object::new();
        fields.insert(REQUEST_ID.into(), Value::String(request_id.clone()));
        fields.insert(ACTIVITY.into(), Value::from(A::KIND));
        let receiver = module.unwrap_or(BROADCAST_UID);

        match self
            .bus
            .send_fields(A::LIST, fields, receiver, self.send_timeout())
            .await
        {
            Ok(()) => {
                let window = Duration::from_millis(self.bus.config().query_timeout_ms);
                let deadline = tokio::time::Instant::now() + window;
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        // A directed query is done at the first answer.
                        Ok(Some(())) if module.is_some() => break,
                        Ok(Some(())) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
            }
            Err(e) => {
                debug!(kind = A::KIND, error = %e, "List request not sent, using cache");
            }
        }

        self.pending.remove(&request_id);
        self.cached_metadata(module)
    }

    // -----------------------------------------------------------------------
    // Bus hooks
    // -----------------------------------------------------------------------

    fn link_remote(&self, mut metadata: EAMetadata) -> EAMetadata {
        if let Some(module) = self
            .modules
            .as_ref()
            .and_then(|m| m.get(metadata.module_uid()))
        {
            metadata.link(&module);
        }
        metadata
    }

    /// Cache entries from an announce or reply. Local entries are never
    /// overwritten by remote ones.
    fn merge_remote(&self, message: &Message) -> usize {
        let Some(entries) = message
            .get_fields()
            .get(METADATA)
            .and_then(|v| v.as_array().ok())
        else {
            warn!(kind = A::KIND, sender = message.sender().uid, "Metadata list missing");
            return 0;
        };

        let default_module = message.receiver().uid;
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            match metadata_from_value(entry, default_module) {
                Ok(metadata) => decoded.push(Arc::new(self.link_remote(metadata))),
                Err(e) => warn!(kind = A::KIND, error = %e, "Skipping malformed metadata"),
            }
        }

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let mut merged = 0;
        for metadata in decoded {
            let module_entries = registry.entry(metadata.module_uid()).or_default();
            if module_entries
                .get(metadata.name())
                .is_some_and(|r| r.local)
            {
                continue;
            }
            upsert(module_entries, metadata, false);
            merged += 1;
        }
        merged
    }

    fn on_announce(&self, message: &Message) {
        let merged = self.merge_remote(message);
        debug!(
            kind = A::KIND,
            sender = message.sender().uid,
            merged,
            "Cached announced activities"
        );
    }

    fn on_denounce(&self, message: &Message) {
        let module = message.receiver().uid;
        let names: Vec<&str> = message
            .get_fields()
            .get(METADATA)
            .and_then(|v| v.as_array().ok())
            .map(|items| items.iter().filter_map(|v| v.as_string().ok()).collect())
            .unwrap_or_default();

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = registry.get_mut(&module) {
            for name in &names {
                if entries.get(*name).is_some_and(|r| !r.local) {
                    entries.remove(*name);
                }
            }
            if entries.is_empty() {
                registry.remove(&module);
            }
        }
        debug!(kind = A::KIND, module, names = ?names, "Dropped denounced activities");
    }

    fn on_trigger(&self, message: &Message) {
        let mut params = message.get_fields().clone();
        let name = match params.remove(NAME).map(Value::into_string) {
            Some(Ok(name)) => name,
            _ => {
                warn!(kind = A::KIND, sender = message.sender().uid, "Trigger without a name");
                return;
            }
        };
        let module = message.receiver().uid;
        let ran = self.run_handlers(module, &name, params, message.sender());
        trace!(kind = A::KIND, module, name = %name, ran, "Trigger handled");
    }

    fn on_list_request(&self, message: &Message) {
        let fields = message.get_fields();
        if fields
            .get(ACTIVITY)
            .and_then(|v| v.as_string().ok())
            .is_some_and(|kind| kind != A::KIND)
        {
            return;
        }
        let Some(request_id) = fields.get(REQUEST_ID).and_then(|v| v.as_string().ok()) else {
            warn!(kind = A::KIND, sender = message.sender().uid, "List request without id");
            return;
        };

        let receiver = message.receiver().uid;
        let scope = (receiver != BROADCAST_UID).then_some(receiver);
        let local = self.local_metadata(scope);
        if local.is_empty() {
            return;
        }

        let mut reply = Object::new();
        reply.insert(REQUEST_ID.into(), Value::from(request_id));
        reply.insert(ACTIVITY.into(), Value::from(A::KIND));
        reply.insert(METADATA.into(), metadata_list(&local));

        let bus = self.bus.clone();
        let requester = message.sender().uid;
        let timeout_ms = self.send_timeout();
        debug!(kind = A::KIND, requester, count = local.len(), "Answering list request");
        tokio::spawn(async move {
            if let Err(e) = bus
                .send_fields(MessageType::Reply, reply, requester, timeout_ms)
                .await
            {
                warn!(requester, error = %e, "List reply failed");
            }
        });
    }

    fn on_reply(&self, message: &Message) {
        let fields = message.get_fields();
        if fields
            .get(ACTIVITY)
            .and_then(|v| v.as_string().ok())
            .is_some_and(|kind| kind != A::KIND)
        {
            return;
        }
        let Some(request_id) = fields.get(REQUEST_ID).and_then(|v| v.as_string().ok()) else {
            return;
        };
        let Some(waiter) = self.pending.get(request_id).map(|w| w.value().clone()) else {
            trace!(kind = A::KIND, request_id, "Reply for unknown request");
            return;
        };
        self.merge_remote(message);
        // The query may already have timed out.
        let _ = waiter.send(());
    }

    fn on_desintegrate(&self, message: &Message) {
        let module = message.sender().uid;
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = registry.get_mut(&module) {
            entries.retain(|_, r| r.local);
            if entries.is_empty() {
                registry.remove(&module);
            }
            debug!(kind = A::KIND, module, "Forgot activities of departed module");
        }
    }
}

impl<A: Activity> Drop for Controller<A> {
    fn drop(&mut self) {
        for id in &self.hooks {
            self.bus.remove_message_handler(*id);
        }
    }
}

/// Insert or replace an entry, keeping the handlers of the old one.
fn upsert<A: Activity>(
    entries: &mut BTreeMap<String, Registration<A>>,
    metadata: Arc<EAMetadata>,
    local: bool,
) {
    match entries.get_mut(metadata.name()) {
        Some(existing) => {
            existing.metadata = metadata;
            existing.local = local;
        }
        None => {
            entries.insert(
                metadata.name().to_string(),
                Registration::new(metadata, local),
            );
        }
    }
}

/// Register a bus handler that forwards to `method` while the controller
/// is alive. It never stops dispatch.
fn hook<A: Activity>(
    bus: &Bus,
    kind: MessageType,
    weak: &Weak<Controller<A>>,
    method: fn(&Controller<A>, &Message),
) -> HandlerId {
    let weak = weak.clone();
    bus.add_message_handler(kind, move |message| {
        if let Some(controller) = weak.upgrade() {
            method(&controller, message);
        }
        true
    })
}
