use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use uuid::Uuid;

use super::DeliveryChannel;
use crate::endpoint::{Endpoint, EprFragment, ExternalEndpoint, InternalEndpoint};
use crate::error::{JbiError, JbiResult};
use crate::executor::{PollingTask, WorkExecutor};
use crate::naming::{ComponentNameSpace, QName};
use crate::registry::Registry;
use crate::subscription::SubscriptionSpec;

/// Container services handed to a component at init.
pub struct ComponentContext {
    namespace: ComponentNameSpace,
    install_root: PathBuf,
    workspace_root: PathBuf,
    channel: Arc<dyn DeliveryChannel>,
    executor: WorkExecutor,
    join_timeout: Duration,
    registry: Weak<Registry>,
}

impl ComponentContext {
    pub(crate) fn new(
        namespace: ComponentNameSpace,
        install_root: PathBuf,
        workspace_root: PathBuf,
        channel: Arc<dyn DeliveryChannel>,
        registry: &Arc<Registry>,
    ) -> Self {
        Self {
            namespace,
            install_root,
            workspace_root,
            channel,
            executor: registry.executor().clone(),
            join_timeout: registry.config().stop_join_timeout(),
            registry: Arc::downgrade(registry),
        }
    }

    #[must_use]
    pub fn component_name(&self) -> &str {
        self.namespace.name()
    }

    #[must_use]
    pub fn namespace(&self) -> &ComponentNameSpace {
        &self.namespace
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Private scratch directory that survives reinstallation of the same version.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn delivery_channel(&self) -> Arc<dyn DeliveryChannel> {
        Arc::clone(&self.channel)
    }

    #[must_use]
    pub fn executor(&self) -> &WorkExecutor {
        &self.executor
    }

    /// Run `tick` every `interval` on the shared executor.
    pub fn spawn_polling<F, Fut>(&self, name: &str, interval: Duration, tick: F) -> PollingTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.executor
            .spawn_polling(format!("{}:{name}", self.namespace), interval, tick)
    }

    /// Stop a polling task with the container's bounded join wait.
    pub async fn stop_polling(&self, task: PollingTask) -> bool {
        task.stop(self.join_timeout).await
    }

    /// # Errors
    /// Returns `JbiError::DuplicateEndpoint` if the endpoint is already active.
    pub fn activate_endpoint(
        &self,
        service: QName,
        endpoint: &str,
        interfaces: Vec<QName>,
    ) -> JbiResult<Arc<InternalEndpoint>> {
        self.registry()?
            .endpoints()
            .register_internal_endpoint(&self.namespace, service, endpoint, interfaces)
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn deactivate_endpoint(&self, endpoint: &InternalEndpoint) -> JbiResult<()> {
        self.registry()?
            .endpoints()
            .unregister_internal_endpoint(endpoint.service_name(), endpoint.endpoint_name());
        Ok(())
    }

    /// # Errors
    /// Returns `JbiError::DuplicateEndpoint` if the external address is taken.
    pub fn register_external_endpoint(
        &self,
        service: QName,
        endpoint: &str,
        interfaces: Vec<QName>,
    ) -> JbiResult<Arc<ExternalEndpoint>> {
        self.registry()?
            .endpoints()
            .register_external_endpoint(&self.namespace, service, endpoint, interfaces)
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn deregister_external_endpoint(&self, endpoint: &ExternalEndpoint) -> JbiResult<()> {
        self.registry()?
            .endpoints()
            .unregister_external_endpoint(&endpoint.key.service, &endpoint.key.endpoint);
        Ok(())
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn get_endpoint(&self, service: &QName, endpoint: &str) -> JbiResult<Option<Endpoint>> {
        Ok(self.registry()?.endpoints().get_endpoint(service, endpoint))
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn get_endpoints_for_interface(&self, interface: Option<&QName>) -> JbiResult<Vec<Arc<InternalEndpoint>>> {
        Ok(self.registry()?.endpoints().get_endpoints_for_interface(interface))
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn get_endpoints_for_service(&self, service: &QName) -> JbiResult<Vec<Arc<InternalEndpoint>>> {
        Ok(self.registry()?.endpoints().get_endpoints_for_service(service))
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn resolve_endpoint_reference(&self, fragment: &EprFragment) -> JbiResult<Option<Endpoint>> {
        Ok(self.registry()?.resolve_endpoint_reference(fragment))
    }

    /// Subscribe one of this component's endpoints; the owner is forced to this component.
    ///
    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn subscribe(&self, mut spec: SubscriptionSpec, endpoint: Arc<InternalEndpoint>) -> JbiResult<Uuid> {
        spec.owner = self.namespace.clone();
        Ok(self.registry()?.subscriptions().register(spec, endpoint))
    }

    /// # Errors
    /// Returns `JbiError::RegistryUnavailable` once the container is gone.
    pub fn unsubscribe(&self, id: Uuid) -> JbiResult<bool> {
        Ok(self.registry()?.subscriptions().deregister(id))
    }

    fn registry(&self) -> JbiResult<Arc<Registry>> {
        self.registry.upgrade().ok_or(JbiError::RegistryUnavailable)
    }
}
