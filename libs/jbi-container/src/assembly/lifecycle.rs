//! Service assembly state machine: `SHUTDOWN <-> STOPPED <-> STARTED`.
//!
//! Cascades to the units collect every failure instead of stopping at the
//! first one; the assembly state only advances when no unit failed. A failed
//! start rolls connections and units back to where the assembly was.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::ServiceUnitLifeCycle;
use crate::descriptor::{ConnectionDescriptor, ServiceAssemblyDescriptor};
use crate::endpoint::EndpointKey;
use crate::error::{JbiError, JbiResult};
use crate::events::DeploymentEventKind;
use crate::registry::Registry;
use crate::state::LifeCycleState;

#[derive(Debug, Default)]
struct Transitions {
    connections_active: bool,
}

pub struct ServiceAssemblyLifeCycle {
    descriptor: ServiceAssemblyDescriptor,
    root: PathBuf,
    units: Vec<Arc<ServiceUnitLifeCycle>>,
    state: RwLock<LifeCycleState>,
    transitions: Mutex<Transitions>,
    registry: Weak<Registry>,
}

impl ServiceAssemblyLifeCycle {
    pub(crate) fn new(
        descriptor: ServiceAssemblyDescriptor,
        root: PathBuf,
        units: Vec<Arc<ServiceUnitLifeCycle>>,
        registry: &Arc<Registry>,
    ) -> Self {
        Self {
            descriptor,
            root,
            units,
            state: RwLock::new(LifeCycleState::Shutdown),
            transitions: Mutex::new(Transitions::default()),
            registry: Arc::downgrade(registry),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceAssemblyDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn units(&self) -> &[Arc<ServiceUnitLifeCycle>] {
        &self.units
    }

    #[must_use]
    pub fn state(&self) -> LifeCycleState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state().is_stopped()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state().is_shut_down()
    }

    #[must_use]
    pub fn target_components(&self) -> Vec<String> {
        self.descriptor.target_components()
    }

    #[must_use]
    pub fn targets_component(&self, component: &str) -> bool {
        self.units.iter().any(|u| u.component_name() == component)
    }

    /// Whether every target component is currently started.
    #[must_use]
    pub fn components_started(&self, registry: &Registry) -> bool {
        self.target_components().iter().all(|name| {
            registry
                .components()
                .get(name)
                .is_some_and(|c| c.is_started())
        })
    }

    /// Activate connections, init shut-down units, then start stopped units.
    ///
    /// # Errors
    /// Returns `JbiError::Composite` with every unit failure. Connections are
    /// then deactivated again and the units returned to the assembly's state.
    pub async fn start(&self, write_state: bool) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut tr = self.transitions.lock().await;
        let previous = self.state();
        if previous.is_started() {
            return Ok(());
        }
        tracing::info!(assembly = %self.name(), "starting service assembly");
        if !tr.connections_active {
            self.activate_connections(&registry)?;
            tr.connections_active = true;
        }

        let mut failures = Vec::new();
        for unit in &self.units {
            if unit.state().is_shut_down()
                && let Err(e) = unit.init().await
            {
                failures.push(e);
            }
        }
        for unit in &self.units {
            if unit.state().is_stopped()
                && let Err(e) = unit.start().await
            {
                failures.push(e);
            }
        }
        if !failures.is_empty() {
            self.roll_back_start(&registry, &mut tr, previous).await;
        }
        self.finish(
            &registry,
            "start",
            failures,
            LifeCycleState::Started,
            write_state,
            DeploymentEventKind::Started,
        )
    }

    /// Deactivate connections and stop started units.
    ///
    /// With `force_init`, shut-down units are initialised first so the
    /// assembly really ends up `STOPPED` (used when restoring).
    ///
    /// # Errors
    /// Returns `JbiError::InvalidState` when called on a shut-down assembly
    /// without `force_init`, and `JbiError::Composite` with every unit failure.
    pub async fn stop(&self, write_state: bool, force_init: bool) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut tr = self.transitions.lock().await;
        let state = self.state();
        if state.is_shut_down() && !force_init {
            return Err(JbiError::InvalidState {
                entity: "service assembly",
                name: self.name().to_owned(),
                task: "stop",
                state,
            });
        }
        tracing::info!(assembly = %self.name(), "stopping service assembly");
        if tr.connections_active {
            self.deactivate_connections(&registry);
            tr.connections_active = false;
        }

        let mut failures = Vec::new();
        if force_init {
            for unit in &self.units {
                if unit.state().is_shut_down()
                    && let Err(e) = unit.init().await
                {
                    failures.push(e);
                }
            }
        }
        for unit in &self.units {
            if unit.state().is_started()
                && let Err(e) = unit.stop().await
            {
                failures.push(e);
            }
        }
        self.finish(
            &registry,
            "stop",
            failures,
            LifeCycleState::Stopped,
            write_state,
            DeploymentEventKind::Stopped,
        )
    }

    /// Stop started units, then shut down every unit that is not already down.
    ///
    /// # Errors
    /// Returns `JbiError::Composite` with every unit failure.
    pub async fn shut_down(&self, write_state: bool) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut tr = self.transitions.lock().await;
        if self.is_shut_down() {
            return Ok(());
        }
        tracing::info!(assembly = %self.name(), "shutting down service assembly");
        if tr.connections_active {
            self.deactivate_connections(&registry);
            tr.connections_active = false;
        }

        let mut failures = Vec::new();
        for unit in &self.units {
            if unit.state().is_started()
                && let Err(e) = unit.stop().await
            {
                failures.push(e);
            }
        }
        for unit in &self.units {
            if unit.state().is_stopped()
                && let Err(e) = unit.shut_down().await
            {
                failures.push(e);
            }
        }
        self.finish(
            &registry,
            "shut down",
            failures,
            LifeCycleState::Shutdown,
            write_state,
            DeploymentEventKind::ShutDown,
        )
    }

    /// Replay the persisted state without rewriting it.
    ///
    /// `STARTED` starts; anything else stops with forced init, followed by a
    /// shutdown when the persisted state was `SHUTDOWN`. A missing state counts
    /// as `SHUTDOWN`.
    ///
    /// # Errors
    /// Returns the failing transition's error.
    pub async fn restore(&self) -> JbiResult<()> {
        let persisted = self.persisted_state()?.unwrap_or(LifeCycleState::Shutdown);
        tracing::debug!(assembly = %self.name(), state = %persisted, "restoring service assembly");
        if persisted.is_started() {
            return self.start(false).await;
        }
        self.stop(false, true).await?;
        if persisted.is_shut_down() {
            self.shut_down(false).await?;
        }
        Ok(())
    }

    /// Drop connection aliases still registered for this assembly.
    pub(crate) async fn release_connections(&self) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut tr = self.transitions.lock().await;
        if tr.connections_active {
            self.deactivate_connections(&registry);
            tr.connections_active = false;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the state file cannot be read.
    pub fn persisted_state(&self) -> JbiResult<Option<LifeCycleState>> {
        self.registry()?.store().assembly_state(self.name())
    }

    pub(crate) fn persist_state(&self, registry: &Registry) -> JbiResult<()> {
        registry.store().set_assembly_state(self.name(), self.state())
    }

    fn finish(
        &self,
        registry: &Registry,
        task: &'static str,
        failures: Vec<JbiError>,
        target: LifeCycleState,
        write_state: bool,
        event: DeploymentEventKind,
    ) -> JbiResult<()> {
        if !failures.is_empty() {
            tracing::warn!(
                assembly = %self.name(),
                task,
                failures = failures.len(),
                "service assembly transition failed"
            );
            return Err(JbiError::Composite {
                task,
                assembly: self.name().to_owned(),
                failures,
            });
        }
        *self.state.write() = target;
        if write_state {
            self.persist_state(registry)?;
        }
        registry.events().fire_assembly(self.name(), event);
        Ok(())
    }

    /// Best effort: stop units started by the failed attempt and, when the
    /// assembly was shut down, shut down the units it initialised.
    async fn roll_back_start(&self, registry: &Registry, tr: &mut Transitions, previous: LifeCycleState) {
        if tr.connections_active {
            self.deactivate_connections(registry);
            tr.connections_active = false;
        }
        for unit in &self.units {
            if unit.state().is_started()
                && let Err(e) = unit.stop().await
            {
                tracing::warn!(assembly = %self.name(), unit = %unit.key(), error = %e, "rollback stop failed");
            }
        }
        if !previous.is_shut_down() {
            return;
        }
        for unit in &self.units {
            if unit.state().is_stopped()
                && let Err(e) = unit.shut_down().await
            {
                tracing::warn!(assembly = %self.name(), unit = %unit.key(), error = %e, "rollback shutdown failed");
            }
        }
    }

    fn activate_connections(&self, registry: &Registry) -> JbiResult<()> {
        for (index, connection) in self.descriptor.connections.iter().enumerate() {
            if let Err(e) = self.activate_connection(registry, connection) {
                for activated in &self.descriptor.connections[..index] {
                    Self::deactivate_connection(registry, activated);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn activate_connection(&self, registry: &Registry, connection: &ConnectionDescriptor) -> JbiResult<()> {
        let consumer = &connection.consumer;
        let to = EndpointKey::new(
            connection.provider.service.clone(),
            connection.provider.endpoint.clone(),
        );
        if let (Some(service), Some(endpoint)) = (&consumer.service, &consumer.endpoint) {
            let link_type = self
                .units
                .iter()
                .filter_map(|u| u.services())
                .find_map(|s| s.link_type_for(service, endpoint))
                .unwrap_or_default();
            registry.endpoints().register_endpoint_connection(
                EndpointKey::new(service.clone(), endpoint.clone()),
                to,
                link_type,
            )?;
        } else if let Some(interface) = &consumer.interface {
            registry
                .endpoints()
                .register_interface_connection(interface.clone(), to)?;
        } else {
            tracing::warn!(assembly = %self.name(), "connection without a consumer address ignored");
        }
        Ok(())
    }

    fn deactivate_connections(&self, registry: &Registry) {
        for connection in &self.descriptor.connections {
            Self::deactivate_connection(registry, connection);
        }
    }

    fn deactivate_connection(registry: &Registry, connection: &ConnectionDescriptor) {
        let consumer = &connection.consumer;
        if let (Some(service), Some(endpoint)) = (&consumer.service, &consumer.endpoint) {
            registry
                .endpoints()
                .unregister_endpoint_connection(&EndpointKey::new(service.clone(), endpoint.clone()));
        } else if let Some(interface) = &consumer.interface {
            registry.endpoints().unregister_interface_connection(interface);
        }
    }

    fn registry(&self) -> JbiResult<Arc<Registry>> {
        self.registry.upgrade().ok_or(JbiError::RegistryUnavailable)
    }
}

impl std::fmt::Debug for ServiceAssemblyLifeCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAssemblyLifeCycle")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("units", &self.units.len())
            .finish_non_exhaustive()
    }
}
