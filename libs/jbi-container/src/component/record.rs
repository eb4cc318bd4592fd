//! Per-component lifecycle state machine.
//!
//! `UNKNOWN -> SHUTDOWN <-> STOPPED <-> STARTED`. The `do_*` transitions
//! drive the plugin and cascade to the component's service assemblies; the
//! public `start`/`stop`/`shut_down` additionally persist the reached state so
//! [`ComponentRecord::set_initial_running_state`] can replay it after a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{Component, ComponentContext, DeliveryChannel, PluginScope, ServiceUnitManager};
use crate::config::ThrottlingConfig;
use crate::descriptor::{ComponentDescriptor, ComponentKind};
use crate::error::{JbiError, JbiResult};
use crate::events::ComponentEventKind;
use crate::naming::ComponentNameSpace;
use crate::registry::Registry;
use crate::state::LifeCycleState;

/// Everything needed to create a [`ComponentRecord`].
pub struct ComponentParts {
    pub namespace: ComponentNameSpace,
    pub descriptor: ComponentDescriptor,
    pub plugin: Arc<dyn Component>,
    pub scope: Arc<PluginScope>,
    pub install_root: PathBuf,
    pub workspace_root: PathBuf,
    /// Embedded components are not persisted and always start with the container.
    pub pojo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStats {
    pub name: String,
    pub state: LifeCycleState,
    pub kind: ComponentKind,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub throttling: ThrottlingConfig,
}

#[derive(Default)]
struct Runtime {
    channel: Option<Arc<dyn DeliveryChannel>>,
    context: Option<Arc<ComponentContext>>,
    /// Assemblies stopped by the last component stop, resumed on the next start.
    pending_restart: Vec<String>,
}

struct Settings {
    queue_capacity: usize,
    throttling: ThrottlingConfig,
}

pub struct ComponentRecord {
    namespace: ComponentNameSpace,
    descriptor: ComponentDescriptor,
    pojo: bool,
    plugin: Arc<dyn Component>,
    scope: Arc<PluginScope>,
    install_root: PathBuf,
    workspace_root: PathBuf,
    state: RwLock<LifeCycleState>,
    settings: RwLock<Settings>,
    runtime: Mutex<Runtime>,
    registry: Weak<Registry>,
}

impl ComponentRecord {
    pub(crate) fn new(parts: ComponentParts, registry: &Arc<Registry>) -> Self {
        let config = registry.config();
        Self {
            namespace: parts.namespace,
            descriptor: parts.descriptor,
            pojo: parts.pojo,
            plugin: parts.plugin,
            scope: parts.scope,
            install_root: parts.install_root,
            workspace_root: parts.workspace_root,
            state: RwLock::new(LifeCycleState::Unknown),
            settings: RwLock::new(Settings {
                queue_capacity: config.delivery_queue_capacity,
                throttling: config.throttling.clone(),
            }),
            runtime: Mutex::new(Runtime::default()),
            registry: Arc::downgrade(registry),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.namespace.name()
    }

    #[must_use]
    pub fn namespace(&self) -> &ComponentNameSpace {
        &self.namespace
    }

    #[must_use]
    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    #[must_use]
    pub fn is_binding(&self) -> bool {
        self.descriptor.kind == ComponentKind::BindingComponent
    }

    #[must_use]
    pub fn is_engine(&self) -> bool {
        self.descriptor.kind == ComponentKind::ServiceEngine
    }

    #[must_use]
    pub fn is_pojo(&self) -> bool {
        self.pojo
    }

    #[must_use]
    pub fn shared_libraries(&self) -> &[String] {
        &self.descriptor.shared_libraries
    }

    #[must_use]
    pub fn plugin(&self) -> &Arc<dyn Component> {
        &self.plugin
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<PluginScope> {
        &self.scope
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn service_unit_manager(&self) -> Option<Arc<dyn ServiceUnitManager>> {
        self.plugin.service_unit_manager()
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
    pub fn queue_capacity(&self) -> usize {
        self.settings.read().queue_capacity
    }

    /// Takes effect the next time the delivery channel is created.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.settings.write().queue_capacity = capacity;
    }

    #[must_use]
    pub fn throttling(&self) -> ThrottlingConfig {
        self.settings.read().throttling.clone()
    }

    pub fn set_throttling(&self, throttling: ThrottlingConfig) {
        self.settings.write().throttling = throttling;
    }

    /// Current statistics; the queue size is zero while no channel exists.
    pub async fn stats(&self) -> ComponentStats {
        let queue_size = self
            .runtime
            .lock()
            .await
            .channel
            .as_ref()
            .map_or(0, |c| c.queue_size());
        let settings = self.settings.read();
        ComponentStats {
            name: self.name().to_owned(),
            state: self.state(),
            kind: self.descriptor.kind,
            queue_size,
            queue_capacity: settings.queue_capacity,
            throttling: settings.throttling.clone(),
        }
    }

    /// Installation finished: `UNKNOWN -> SHUTDOWN`.
    pub(crate) fn mark_installed(&self) {
        let mut state = self.state.write();
        if *state == LifeCycleState::Unknown {
            *state = LifeCycleState::Shutdown;
        }
    }

    /// Start and persist `STARTED`.
    ///
    /// # Errors
    /// Returns the plugin error of `init` or `start`; the state is left unchanged.
    pub async fn start(&self) -> JbiResult<()> {
        self.do_start().await?;
        self.persist_state()
    }

    /// Stop and persist `STOPPED`.
    ///
    /// # Errors
    /// Returns the plugin error of `stop`; the state is left unchanged.
    pub async fn stop(&self) -> JbiResult<()> {
        self.do_stop().await?;
        self.persist_state()
    }

    /// Shut down and persist `SHUTDOWN`.
    ///
    /// # Errors
    /// Returns the plugin error of `stop` or `shut_down`; the state is left unchanged.
    pub async fn shut_down(&self) -> JbiResult<()> {
        self.do_shut_down().await?;
        self.persist_state()
    }

    /// Start without persisting: re-initialise if shut down, start the plugin,
    /// then bring back the component's service assemblies.
    ///
    /// # Errors
    /// Returns the plugin error of `init` or `start`.
    pub async fn do_start(&self) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut rt = self.runtime.lock().await;
        if self.is_shut_down() {
            self.init_locked(&registry, &mut rt).await?;
        }
        if self.is_started() {
            return Ok(());
        }

        self.plugin
            .start()
            .await
            .map_err(|e| JbiError::plugin(self.name(), "start", e))?;
        self.set_state(LifeCycleState::Started);
        tracing::info!(component = %self.name(), "component started");
        registry
            .events()
            .fire_component(self.name(), ComponentEventKind::Started);

        registry.restore_component_assemblies(self.name()).await;
        let restart = std::mem::take(&mut rt.pending_restart);
        registry.restart_assemblies(&restart).await;
        registry.schedule_pending_check();
        Ok(())
    }

    /// Stop without persisting. Only acts from `STARTED` or `UNKNOWN`.
    ///
    /// # Errors
    /// Returns the plugin error of `stop`.
    pub async fn do_stop(&self) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut rt = self.runtime.lock().await;
        self.stop_locked(&registry, &mut rt).await
    }

    /// Shut down without persisting. No-op from `UNKNOWN` or `SHUTDOWN`.
    ///
    /// # Errors
    /// Returns the plugin error of `stop` or `shut_down`.
    pub async fn do_shut_down(&self) -> JbiResult<()> {
        let registry = self.registry()?;
        let mut rt = self.runtime.lock().await;
        let state = self.state();
        if matches!(state, LifeCycleState::Unknown | LifeCycleState::Shutdown) {
            return Ok(());
        }
        self.stop_locked(&registry, &mut rt).await?;

        registry.shut_down_component_assemblies(self.name()).await;
        self.plugin
            .shut_down()
            .await
            .map_err(|e| JbiError::plugin(self.name(), "shut down", e))?;

        registry.endpoints().unregister_component_endpoints(&self.namespace);
        registry
            .subscriptions()
            .deregister_for_component(&self.namespace);
        if let Some(channel) = rt.channel.take() {
            channel.close();
        }
        rt.context = None;
        self.set_state(LifeCycleState::Shutdown);
        tracing::info!(component = %self.name(), "component shut down");
        registry
            .events()
            .fire_component(self.name(), ComponentEventKind::ShutDown);
        Ok(())
    }

    /// Replay the persisted running state; a component without one starts.
    ///
    /// `STOPPED` is reached through a full start followed by a stop so the
    /// plugin is initialised exactly as it was before the restart.
    ///
    /// # Errors
    /// Returns the first failing transition.
    pub async fn set_initial_running_state(&self) -> JbiResult<()> {
        if self.pojo {
            return self.do_start().await;
        }
        let persisted = self
            .registry()?
            .store()
            .component_state(self.name())?
            .unwrap_or(LifeCycleState::Started);
        tracing::debug!(component = %self.name(), state = %persisted, "applying initial running state");
        match persisted {
            LifeCycleState::Stopped => {
                self.do_start().await?;
                self.do_stop().await
            }
            LifeCycleState::Shutdown => self.do_shut_down().await,
            LifeCycleState::Started | LifeCycleState::Unknown => self.do_start().await,
        }
    }

    /// Running state read back from disk.
    ///
    /// # Errors
    /// Returns an error if the state file cannot be read.
    pub fn persisted_state(&self) -> JbiResult<Option<LifeCycleState>> {
        self.registry()?.store().component_state(self.name())
    }

    async fn init_locked(&self, registry: &Arc<Registry>, rt: &mut Runtime) -> JbiResult<()> {
        std::fs::create_dir_all(&self.workspace_root)
            .map_err(|e| JbiError::io(&self.workspace_root, e))?;
        let (capacity, throttling) = {
            let settings = self.settings.read();
            (settings.queue_capacity, settings.throttling.clone())
        };
        let channel = registry
            .channel_factory()
            .create(&self.namespace, capacity, &throttling);
        let ctx = Arc::new(ComponentContext::new(
            self.namespace.clone(),
            self.install_root.clone(),
            self.workspace_root.clone(),
            Arc::clone(&channel),
            registry,
        ));
        if let Err(e) = self.plugin.init(Arc::clone(&ctx)).await {
            channel.close();
            return Err(JbiError::plugin(self.name(), "init", e));
        }
        rt.channel = Some(channel);
        rt.context = Some(ctx);
        self.set_state(LifeCycleState::Stopped);
        tracing::info!(component = %self.name(), "component initialized");
        registry
            .events()
            .fire_component(self.name(), ComponentEventKind::Initialized);
        Ok(())
    }

    async fn stop_locked(&self, registry: &Arc<Registry>, rt: &mut Runtime) -> JbiResult<()> {
        let state = self.state();
        if !matches!(state, LifeCycleState::Started | LifeCycleState::Unknown) {
            return Ok(());
        }
        for name in registry.stop_component_assemblies(self.name()).await {
            if !rt.pending_restart.contains(&name) {
                rt.pending_restart.push(name);
            }
        }
        self.plugin
            .stop()
            .await
            .map_err(|e| JbiError::plugin(self.name(), "stop", e))?;
        self.set_state(LifeCycleState::Stopped);
        tracing::info!(component = %self.name(), "component stopped");
        registry
            .events()
            .fire_component(self.name(), ComponentEventKind::Stopped);
        Ok(())
    }

    fn persist_state(&self) -> JbiResult<()> {
        if self.pojo {
            return Ok(());
        }
        self.registry()?
            .store()
            .set_component_state(self.name(), self.state())
    }

    fn set_state(&self, state: LifeCycleState) {
        *self.state.write() = state;
    }

    fn registry(&self) -> JbiResult<Arc<Registry>> {
        self.registry.upgrade().ok_or(JbiError::RegistryUnavailable)
    }
}

impl std::fmt::Debug for ComponentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRecord")
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .field("pojo", &self.pojo)
            .finish_non_exhaustive()
    }
}
