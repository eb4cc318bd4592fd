//! Aggregate registry.
//!
//! Composes the endpoint, subscription, component, shared-library and
//! service-assembly registries behind one handle and owns the pending queues
//! used to (re)activate assemblies and components once their dependencies
//! become available.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::assembly::{ServiceAssemblyLifeCycle, ServiceAssemblyRegistry, ServiceUnitLifeCycle};
use crate::component::{
    ComponentParts, ComponentRecord, ComponentRegistry, DeliveryChannelFactory,
};
use crate::config::ContainerConfig;
use crate::endpoint::{
    DynamicEndpoint, Endpoint, EndpointKey, EndpointRegistry, EprFragment, parse_reference,
};
use crate::error::JbiResult;
use crate::events::EventBus;
use crate::executor::WorkExecutor;
use crate::library::SharedLibraryRegistry;
use crate::persistence::StateStore;
use crate::state::LifeCycleState;
use crate::subscription::SubscriptionRegistry;

pub struct Registry {
    config: ContainerConfig,
    store: StateStore,
    events: Arc<EventBus>,
    executor: WorkExecutor,
    channel_factory: Arc<dyn DeliveryChannelFactory>,
    endpoints: EndpointRegistry,
    subscriptions: SubscriptionRegistry,
    components: ComponentRegistry,
    libraries: SharedLibraryRegistry,
    assemblies: ServiceAssemblyRegistry,
    pending_assemblies: Mutex<Vec<Arc<ServiceAssemblyLifeCycle>>>,
    pending_components: Mutex<Vec<Arc<ComponentRecord>>>,
    pending_check: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Must be called from within a tokio runtime (the event dispatcher is spawned here).
    pub fn new(config: ContainerConfig, channel_factory: Arc<dyn DeliveryChannelFactory>) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        Arc::new(Self {
            store: StateStore::new(config.root_dir.clone()),
            config,
            endpoints: EndpointRegistry::new(Arc::clone(&events)),
            events,
            executor: WorkExecutor::new(),
            channel_factory,
            subscriptions: SubscriptionRegistry::new(),
            components: ComponentRegistry::new(),
            libraries: SharedLibraryRegistry::new(),
            assemblies: ServiceAssemblyRegistry::new(),
            pending_assemblies: Mutex::new(Vec::new()),
            pending_components: Mutex::new(Vec::new()),
            pending_check: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn executor(&self) -> &WorkExecutor {
        &self.executor
    }

    #[must_use]
    pub fn channel_factory(&self) -> &Arc<dyn DeliveryChannelFactory> {
        &self.channel_factory
    }

    #[must_use]
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    #[must_use]
    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    #[must_use]
    pub fn libraries(&self) -> &SharedLibraryRegistry {
        &self.libraries
    }

    #[must_use]
    pub fn assemblies(&self) -> &ServiceAssemblyRegistry {
        &self.assemblies
    }

    /// Create and register a component record in state `UNKNOWN`.
    ///
    /// # Errors
    /// Returns `JbiError::ComponentAlreadyInstalled` for a duplicate name.
    pub fn register_component(self: &Arc<Self>, parts: ComponentParts) -> JbiResult<Arc<ComponentRecord>> {
        let record = Arc::new(ComponentRecord::new(parts, self));
        self.components.register(Arc::clone(&record))?;
        Ok(record)
    }

    pub fn deregister_component(&self, name: &str) -> Option<Arc<ComponentRecord>> {
        self.pending_components.lock().retain(|c| c.name() != name);
        self.components.deregister(name)
    }

    #[must_use]
    pub fn get_component(&self, name: &str) -> Option<Arc<ComponentRecord>> {
        self.components.get(name)
    }

    #[must_use]
    pub fn get_service_assembly(&self, name: &str) -> Option<Arc<ServiceAssemblyLifeCycle>> {
        self.assemblies.get(name)
    }

    #[must_use]
    pub fn get_deployed_service_assemblies_for_component(&self, component: &str) -> Vec<Arc<ServiceAssemblyLifeCycle>> {
        self.assemblies.get_for_component(component)
    }

    #[must_use]
    pub fn get_deployed_service_units_for_component(&self, component: &str) -> Vec<Arc<ServiceUnitLifeCycle>> {
        self.assemblies.units_for_component(component)
    }

    /// Resolve an endpoint reference.
    ///
    /// Every component plugin gets the first chance (the first answer wins and
    /// becomes a dynamic endpoint); then the JBI and WS-Addressing formats are
    /// tried against the internal endpoints.
    #[must_use]
    pub fn resolve_endpoint_reference(&self, fragment: &EprFragment) -> Option<Endpoint> {
        for component in self.components.components() {
            if let Some(resolved) = component.plugin().resolve_endpoint_reference(fragment) {
                tracing::debug!(component = %component.name(), service = %resolved.service, "endpoint reference resolved by component");
                return Some(Endpoint::Dynamic(Arc::new(DynamicEndpoint {
                    component: component.namespace().clone(),
                    key: EndpointKey::new(resolved.service, resolved.endpoint),
                    fragment: fragment.clone(),
                })));
            }
        }
        let resolved = parse_reference(fragment)?;
        self.endpoints
            .get_internal_endpoint(&resolved.service, &resolved.endpoint)
            .map(Endpoint::Internal)
    }

    /// Queue an assembly until all its target components are started.
    pub fn add_pending_assembly(&self, assembly: Arc<ServiceAssemblyLifeCycle>) {
        let mut pending = self.pending_assemblies.lock();
        if !pending.iter().any(|a| a.name() == assembly.name()) {
            tracing::info!(assembly = %assembly.name(), "service assembly waiting for its components");
            pending.push(assembly);
        }
    }

    pub fn remove_pending_assembly(&self, name: &str) {
        self.pending_assemblies.lock().retain(|a| a.name() != name);
    }

    #[must_use]
    pub fn pending_assemblies(&self) -> Vec<String> {
        self.pending_assemblies
            .lock()
            .iter()
            .map(|a| a.name().to_owned())
            .collect()
    }

    /// Queue a component whose running state could not be applied yet.
    pub fn add_pending_component(&self, component: Arc<ComponentRecord>) {
        let mut pending = self.pending_components.lock();
        if !pending.iter().any(|c| c.name() == component.name()) {
            tracing::info!(component = %component.name(), "component queued for a later start");
            pending.push(component);
        }
    }

    #[must_use]
    pub fn pending_components(&self) -> Vec<String> {
        self.pending_components
            .lock()
            .iter()
            .map(|c| c.name().to_owned())
            .collect()
    }

    /// Restore every queued assembly whose target components are all started.
    pub async fn check_pending_assemblies(&self) {
        let _serial = self.pending_check.lock().await;
        let ready: Vec<_> = {
            let mut pending = self.pending_assemblies.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|a| a.components_started(self));
            *pending = waiting;
            ready
        };
        for assembly in ready {
            if !self.assemblies.contains(assembly.name()) {
                continue;
            }
            match assembly.restore().await {
                Ok(()) => {
                    tracing::info!(assembly = %assembly.name(), state = %assembly.state(), "pending service assembly restored");
                }
                Err(e) => {
                    tracing::error!(assembly = %assembly.name(), error = %e, "failed to restore pending service assembly");
                }
            }
        }
    }

    /// Retry the initial running state of every queued component.
    pub async fn check_pending_components(&self) {
        let queued: Vec<_> = std::mem::take(&mut *self.pending_components.lock());
        for component in queued {
            if self.components.get(component.name()).is_none() {
                continue;
            }
            if let Err(e) = component.set_initial_running_state().await {
                tracing::warn!(component = %component.name(), error = %e, "pending component still cannot start");
                self.add_pending_component(component);
            }
        }
    }

    /// Run both pending checks in the background.
    pub fn schedule_pending_check(self: &Arc<Self>) {
        if self.executor.is_shut_down() {
            return;
        }
        let registry = Arc::clone(self);
        self.executor.spawn(async move {
            registry.check_pending_components().await;
            registry.check_pending_assemblies().await;
        });
    }

    /// Restore shut-down assemblies whose persisted state says they should run.
    ///
    /// Assemblies whose components are not all started are queued instead.
    pub async fn restore_assemblies(&self) {
        for assembly in self.assemblies.assemblies() {
            self.restore_or_queue(assembly).await;
        }
    }

    /// After a component started: bring back its shut-down assemblies.
    pub(crate) async fn restore_component_assemblies(&self, component: &str) {
        for assembly in self.assemblies.get_for_component(component) {
            self.restore_or_queue(assembly).await;
        }
    }

    /// After a component started: resume the assemblies its last stop suspended.
    pub(crate) async fn restart_assemblies(&self, names: &[String]) {
        for name in names {
            let Some(assembly) = self.assemblies.get(name) else {
                continue;
            };
            if !assembly.is_stopped() {
                continue;
            }
            if !assembly.components_started(self) {
                self.add_pending_assembly(assembly);
                continue;
            }
            if let Err(e) = assembly.start(false).await {
                tracing::warn!(assembly = %name, error = %e, "failed to restart service assembly");
            }
        }
    }

    /// Before a component stops: stop its started assemblies without
    /// persisting. Returns the names of the assemblies that were stopped.
    pub(crate) async fn stop_component_assemblies(&self, component: &str) -> Vec<String> {
        let mut stopped = Vec::new();
        for assembly in self.assemblies.get_for_component(component) {
            if !assembly.is_started() {
                continue;
            }
            match assembly.stop(false, false).await {
                Ok(()) => stopped.push(assembly.name().to_owned()),
                Err(e) => {
                    tracing::warn!(component = %component, assembly = %assembly.name(), error = %e, "failed to stop service assembly");
                }
            }
        }
        stopped
    }

    /// Before a component shuts down: shut its assemblies down without persisting.
    pub(crate) async fn shut_down_component_assemblies(&self, component: &str) {
        for assembly in self.assemblies.get_for_component(component) {
            if assembly.is_shut_down() {
                continue;
            }
            if let Err(e) = assembly.shut_down(false).await {
                tracing::warn!(component = %component, assembly = %assembly.name(), error = %e, "failed to shut down service assembly");
            }
        }
    }

    async fn restore_or_queue(&self, assembly: Arc<ServiceAssemblyLifeCycle>) {
        if !assembly.is_shut_down() {
            return;
        }
        let persisted = match assembly.persisted_state() {
            Ok(state) => state.unwrap_or(LifeCycleState::Shutdown),
            Err(e) => {
                tracing::error!(assembly = %assembly.name(), error = %e, "cannot read service assembly state");
                return;
            }
        };
        if persisted.is_shut_down() {
            return;
        }
        if !assembly.components_started(self) {
            self.add_pending_assembly(assembly);
            return;
        }
        match assembly.restore().await {
            Ok(()) => self.remove_pending_assembly(assembly.name()),
            Err(e) => {
                tracing::warn!(assembly = %assembly.name(), error = %e, "failed to restore service assembly");
            }
        }
    }
}
