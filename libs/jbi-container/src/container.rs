//! Container facade.
//!
//! Phase order: **init** (restore libraries, components and assemblies from
//! disk) → **start** (initial running states, assembly restore, hot deploy)
//! → **shutdown** (monitor, assemblies, components in reverse order, event
//! flush). A restart is `shutdown` followed by a new container on the same root.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::component::{
    Component, ComponentParts, DeliveryChannelFactory, DetachedChannelFactory, PluginLoader,
    PluginScope, StaticPluginLoader,
};
use crate::config::ContainerConfig;
use crate::deployment::{AutoDeploymentService, DeploymentService, InstallationService};
use crate::descriptor::{ComponentDescriptor, DescriptorParser, JsonDescriptorParser};
use crate::error::{JbiError, JbiResult};
use crate::events::{ComponentEventKind, ContainerListener};
use crate::naming::ComponentNameSpace;
use crate::persistence::remove_dir_if_exists;
use crate::registry::Registry;
use crate::state::LifeCycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Built,
    Initialized,
    Started,
    ShutDown,
}

impl Phase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Built => "built",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::ShutDown => "shut down",
        }
    }
}

/// Plugin compiled into the host, registered at init without an archive.
struct Embedded {
    descriptor: ComponentDescriptor,
    plugin: Arc<dyn Component>,
}

pub struct JbiContainerBuilder {
    config: ContainerConfig,
    loader: Option<Arc<dyn PluginLoader>>,
    parser: Option<Arc<dyn DescriptorParser>>,
    channel_factory: Option<Arc<dyn DeliveryChannelFactory>>,
    listeners: Vec<Arc<dyn ContainerListener>>,
    embedded: Vec<Embedded>,
}

impl JbiContainerBuilder {
    #[must_use]
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            loader: None,
            parser: None,
            channel_factory: None,
            listeners: Vec::new(),
            embedded: Vec::new(),
        }
    }

    /// Defaults to [`StaticPluginLoader::from_inventory`].
    #[must_use]
    pub fn with_plugin_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Defaults to [`JsonDescriptorParser`].
    #[must_use]
    pub fn with_descriptor_parser(mut self, parser: Arc<dyn DescriptorParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Defaults to [`DetachedChannelFactory`].
    #[must_use]
    pub fn with_channel_factory(mut self, factory: Arc<dyn DeliveryChannelFactory>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ContainerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Register a compiled-in component. It is not persisted and always
    /// starts with the container.
    #[must_use]
    pub fn with_embedded_component(mut self, descriptor: ComponentDescriptor, plugin: Arc<dyn Component>) -> Self {
        self.embedded.push(Embedded { descriptor, plugin });
        self
    }

    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns `JbiError::Config` for an invalid configuration.
    pub fn build(self) -> JbiResult<JbiContainer> {
        self.config.validate()?;
        let channel_factory = self
            .channel_factory
            .unwrap_or_else(|| Arc::new(DetachedChannelFactory));
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(StaticPluginLoader::from_inventory()));
        let parser = self
            .parser
            .unwrap_or_else(|| Arc::new(JsonDescriptorParser));

        let registry = Registry::new(self.config, channel_factory);
        for listener in self.listeners {
            registry.events().add_listener(listener);
        }
        let installation = Arc::new(InstallationService::new(
            Arc::clone(&registry),
            loader,
            Arc::clone(&parser),
        ));
        let deployment = Arc::new(DeploymentService::new(Arc::clone(&registry), parser));
        let auto_deployment = Arc::new(AutoDeploymentService::new(
            Arc::clone(&registry),
            Arc::clone(&installation),
            Arc::clone(&deployment),
        ));
        Ok(JbiContainer {
            registry,
            installation,
            deployment,
            auto_deployment,
            embedded: Mutex::new(self.embedded),
            phase: tokio::sync::Mutex::new(Phase::Built),
        })
    }
}

pub struct JbiContainer {
    registry: Arc<Registry>,
    installation: Arc<InstallationService>,
    deployment: Arc<DeploymentService>,
    auto_deployment: Arc<AutoDeploymentService>,
    embedded: Mutex<Vec<Embedded>>,
    phase: tokio::sync::Mutex<Phase>,
}

impl JbiContainer {
    #[must_use]
    pub fn builder(config: ContainerConfig) -> JbiContainerBuilder {
        JbiContainerBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        self.registry.config()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn installation(&self) -> &Arc<InstallationService> {
        &self.installation
    }

    #[must_use]
    pub fn deployment(&self) -> &Arc<DeploymentService> {
        &self.deployment
    }

    #[must_use]
    pub fn auto_deployment(&self) -> &Arc<AutoDeploymentService> {
        &self.auto_deployment
    }

    pub fn add_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.registry.events().add_listener(listener);
    }

    /// Create the directory layout and restore everything installed or
    /// deployed by a previous run. Components stay `SHUTDOWN`.
    ///
    /// # Errors
    /// Fails if called twice, if the directories cannot be created, or if the
    /// persisted file maps are unreadable.
    pub async fn init(&self) -> JbiResult<()> {
        let mut phase = self.phase.lock().await;
        self.init_locked(&mut phase).await
    }

    /// Bring components to their persisted running state, restore their
    /// assemblies and start directory monitoring. Runs `init` first if needed.
    ///
    /// Component start failures are logged; the container still starts.
    ///
    /// # Errors
    /// Fails on an init failure or if the container is already started or shut down.
    pub async fn start(&self) -> JbiResult<()> {
        let mut phase = self.phase.lock().await;
        if *phase == Phase::Built {
            self.init_locked(&mut phase).await?;
        }
        if *phase != Phase::Initialized {
            return Err(self.phase_error("start", *phase));
        }
        tracing::info!("Phase: start");
        if let Err(e) = self.registry.components().start_all().await {
            tracing::error!(error = %e, "some components failed to start");
        }
        for component in self.registry.components().components() {
            let meant_down = matches!(component.persisted_state(), Ok(Some(LifeCycleState::Shutdown)));
            if component.is_shut_down() && !meant_down {
                self.registry.add_pending_component(component);
            }
        }
        self.registry.restore_assemblies().await;
        self.registry.check_pending_components().await;
        self.registry.check_pending_assemblies().await;
        self.auto_deployment.start();
        *phase = Phase::Started;
        tracing::info!(
            container = %self.registry.container_name(),
            components = self.registry.components().names().len(),
            assemblies = self.registry.assemblies().names().len(),
            "container started"
        );
        Ok(())
    }

    /// Stop monitoring, shut assemblies and components down without
    /// overwriting their persisted state, then drain background work and events.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let mut phase = self.phase.lock().await;
        if *phase == Phase::ShutDown {
            return;
        }
        tracing::info!("Phase: shutdown");
        self.auto_deployment.stop().await;
        self.deployment.shut_down_all().await;
        if let Err(e) = self.registry.components().shut_down_all().await {
            tracing::error!(error = %e, "some components failed to shut down");
        }
        self.registry
            .executor()
            .shutdown(self.registry.config().stop_join_timeout())
            .await;
        self.registry.events().flush().await;
        *phase = Phase::ShutDown;
        tracing::info!(container = %self.registry.container_name(), "container shut down");
    }

    pub async fn is_started(&self) -> bool {
        *self.phase.lock().await == Phase::Started
    }

    async fn init_locked(&self, phase: &mut Phase) -> JbiResult<()> {
        if *phase != Phase::Built {
            return Err(self.phase_error("init", *phase));
        }
        tracing::info!("Phase: init");
        let config = self.registry.config();
        let store = self.registry.store();
        for dir in [
            store.root().to_path_buf(),
            store.data_dir(),
            config.install_dir(),
            config.deploy_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| JbiError::io(&dir, e))?;
        }
        remove_dir_if_exists(&store.root().join("tmp"))?;

        self.installation.restore().await?;
        self.register_embedded()?;
        self.deployment.restore().await?;
        self.auto_deployment.load_maps().await?;
        *phase = Phase::Initialized;
        Ok(())
    }

    fn register_embedded(&self) -> JbiResult<()> {
        let embedded = std::mem::take(&mut *self.embedded.lock());
        let container = self.registry.container_name().to_owned();
        for Embedded { descriptor, plugin } in embedded {
            let name = descriptor.name.clone();
            let root = self.registry.store().root().join("embedded").join(&name);
            let scope = Arc::new(PluginScope::new(
                name.clone(),
                vec![root.clone()],
                Vec::new(),
                descriptor.delegation,
            ));
            let record = self.registry.register_component(ComponentParts {
                namespace: ComponentNameSpace::new(container.clone(), name.clone()),
                descriptor,
                plugin,
                scope,
                workspace_root: root.join("workspace"),
                install_root: root,
                pojo: true,
            })?;
            record.mark_installed();
            self.registry
                .events()
                .fire_component(&name, ComponentEventKind::Installed);
            tracing::debug!(component = %name, "embedded component registered");
        }
        Ok(())
    }

    fn phase_error(&self, task: &'static str, phase: Phase) -> JbiError {
        JbiError::InvalidContainerPhase {
            container: self.registry.container_name().to_owned(),
            task,
            phase: phase.as_str(),
        }
    }
}
