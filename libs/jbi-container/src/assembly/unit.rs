//! Service unit state machine and bounded deployment calls.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::component::ComponentRecord;
use crate::descriptor::{ServiceUnitDescriptor, ServicesDescriptor};
use crate::error::{JbiError, JbiResult};
use crate::events::DeploymentEventKind;
use crate::registry::Registry;
use crate::state::LifeCycleState;

/// Operations forwarded to a component's service unit manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitTask {
    Deploy,
    Init,
    Start,
    Stop,
    ShutDown,
    Undeploy,
}

impl UnitTask {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ShutDown => "shut down",
            Self::Undeploy => "undeploy",
        }
    }
}

/// Run `task` on the component's service unit manager, bounded by the
/// configured deployment timeout. A call that does not finish in time is
/// aborted and reported as `JbiError::Timeout`.
async fn run_bounded(
    registry: &Registry,
    component: &ComponentRecord,
    unit: &str,
    root: &Path,
    task: UnitTask,
) -> JbiResult<()> {
    let deployment_error = |message: String| JbiError::Deployment {
        task: task.as_str(),
        component: component.name().to_owned(),
        unit: unit.to_owned(),
        message,
    };
    let manager = component
        .service_unit_manager()
        .ok_or_else(|| deployment_error("component does not accept service units".to_owned()))?;

    let timeout = registry.config().deployment_timeout();
    let unit_name = unit.to_owned();
    let root = root.to_path_buf();
    let mut handle = tokio::spawn(async move {
        match task {
            UnitTask::Deploy => manager.deploy(&unit_name, &root).await,
            UnitTask::Init => manager.init(&unit_name, &root).await,
            UnitTask::Start => manager.start(&unit_name).await,
            UnitTask::Stop => manager.stop(&unit_name).await,
            UnitTask::ShutDown => manager.shut_down(&unit_name).await,
            UnitTask::Undeploy => manager.undeploy(&unit_name, &root).await,
        }
    });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(deployment_error(format!("{e:#}"))),
        Ok(Err(join)) => Err(deployment_error(format!("deployment task failed: {join}"))),
        Err(_) => {
            handle.abort();
            tracing::warn!(
                component = %component.name(),
                unit = %unit,
                task = task.as_str(),
                ?timeout,
                "service unit operation timed out"
            );
            Err(JbiError::Timeout {
                task: task.as_str(),
                component: component.name().to_owned(),
                unit: unit.to_owned(),
                timeout,
            })
        }
    }
}

/// A service unit deployed to one component as part of an assembly.
///
/// Operations require the target component to be `STARTED` (`STARTED` or
/// `STOPPED` for shutdown) and fail fast otherwise.
pub struct ServiceUnitLifeCycle {
    descriptor: ServiceUnitDescriptor,
    assembly: String,
    root: PathBuf,
    services: Option<ServicesDescriptor>,
    state: RwLock<LifeCycleState>,
    lock: Mutex<()>,
    registry: Weak<Registry>,
}

impl ServiceUnitLifeCycle {
    pub(crate) fn new(
        descriptor: ServiceUnitDescriptor,
        assembly: impl Into<String>,
        root: PathBuf,
        services: Option<ServicesDescriptor>,
        registry: &Arc<Registry>,
    ) -> Self {
        Self {
            descriptor,
            assembly: assembly.into(),
            root,
            services,
            state: RwLock::new(LifeCycleState::Shutdown),
            lock: Mutex::new(()),
            registry: Arc::downgrade(registry),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn component_name(&self) -> &str {
        &self.descriptor.component
    }

    #[must_use]
    pub fn assembly_name(&self) -> &str {
        &self.assembly
    }

    /// `component/unit`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.descriptor.component, self.descriptor.name)
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceUnitDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn services(&self) -> Option<&ServicesDescriptor> {
        self.services.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> LifeCycleState {
        *self.state.read()
    }

    /// # Errors
    /// Fails if the component is not started or the manager call fails or times out.
    pub async fn init(&self) -> JbiResult<()> {
        self.transition(UnitTask::Init, false, LifeCycleState::Stopped, None)
            .await
    }

    /// # Errors
    /// Fails if the component is not started or the manager call fails or times out.
    pub async fn start(&self) -> JbiResult<()> {
        self.transition(
            UnitTask::Start,
            false,
            LifeCycleState::Started,
            Some(DeploymentEventKind::Started),
        )
        .await
    }

    /// # Errors
    /// Fails if the component is not started or the manager call fails or times out.
    pub async fn stop(&self) -> JbiResult<()> {
        self.transition(
            UnitTask::Stop,
            false,
            LifeCycleState::Stopped,
            Some(DeploymentEventKind::Stopped),
        )
        .await
    }

    /// # Errors
    /// Fails if the component is neither started nor stopped, or the manager call fails or times out.
    pub async fn shut_down(&self) -> JbiResult<()> {
        self.transition(
            UnitTask::ShutDown,
            true,
            LifeCycleState::Shutdown,
            Some(DeploymentEventKind::ShutDown),
        )
        .await
    }

    /// Hand the unit's files to its component.
    ///
    /// # Errors
    /// Fails if the component is not started or the manager call fails or times out.
    pub async fn deploy(&self) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        let registry = self.registry()?;
        let component = self.target_component(&registry, UnitTask::Deploy, false)?;
        run_bounded(&registry, &component, self.name(), &self.root, UnitTask::Deploy).await?;
        tracing::info!(unit = %self.key(), assembly = %self.assembly, "service unit deployed");
        registry.events().fire_unit(
            &self.assembly,
            self.component_name(),
            self.name(),
            DeploymentEventKind::Deployed,
        );
        Ok(())
    }

    /// Remove the unit from its component.
    ///
    /// # Errors
    /// Fails if the component is neither started nor stopped, or the manager call fails or times out.
    pub async fn undeploy(&self) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        let registry = self.registry()?;
        let component = self.target_component(&registry, UnitTask::Undeploy, true)?;
        run_bounded(&registry, &component, self.name(), &self.root, UnitTask::Undeploy).await?;
        tracing::info!(unit = %self.key(), assembly = %self.assembly, "service unit undeployed");
        registry.events().fire_unit(
            &self.assembly,
            self.component_name(),
            self.name(),
            DeploymentEventKind::Undeployed,
        );
        Ok(())
    }

    async fn transition(
        &self,
        task: UnitTask,
        allow_stopped: bool,
        target: LifeCycleState,
        event: Option<DeploymentEventKind>,
    ) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        let registry = self.registry()?;
        let component = self.target_component(&registry, task, allow_stopped)?;
        tracing::debug!(unit = %self.key(), task = task.as_str(), "service unit transition");
        run_bounded(&registry, &component, self.name(), &self.root, task).await?;
        *self.state.write() = target;
        if let Some(kind) = event {
            registry
                .events()
                .fire_unit(&self.assembly, self.component_name(), self.name(), kind);
        }
        Ok(())
    }

    fn target_component(
        &self,
        registry: &Registry,
        task: UnitTask,
        allow_stopped: bool,
    ) -> JbiResult<Arc<ComponentRecord>> {
        let component = registry
            .components()
            .get(self.component_name())
            .ok_or_else(|| JbiError::ComponentNotFound(self.component_name().to_owned()))?;
        let state = component.state();
        if state.is_started() || (allow_stopped && state.is_stopped()) {
            return Ok(component);
        }
        let expected = if allow_stopped {
            "STARTED or STOPPED"
        } else {
            "STARTED"
        };
        Err(JbiError::Deployment {
            task: task.as_str(),
            component: self.component_name().to_owned(),
            unit: self.name().to_owned(),
            message: format!("component is {state}, it must be {expected}"),
        })
    }

    fn registry(&self) -> JbiResult<Arc<Registry>> {
        self.registry.upgrade().ok_or(JbiError::RegistryUnavailable)
    }
}

impl std::fmt::Debug for ServiceUnitLifeCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceUnitLifeCycle")
            .field("key", &self.key())
            .field("assembly", &self.assembly)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
