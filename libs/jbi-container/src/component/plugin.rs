use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::ComponentContext;
use crate::endpoint::{EprFragment, ResolvedReference};

/// A hosted component (binding component or service engine).
///
/// The container drives `init -> start -> stop -> shut_down`; errors returned
/// from a callback leave the component in its previous state.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    async fn init(&self, ctx: Arc<ComponentContext>) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn shut_down(&self) -> anyhow::Result<()>;

    /// Deployment target for service units, if the component accepts any.
    fn service_unit_manager(&self) -> Option<Arc<dyn ServiceUnitManager>> {
        None
    }

    /// Resolve an endpoint reference the component understands.
    fn resolve_endpoint_reference(&self, _fragment: &EprFragment) -> Option<ResolvedReference> {
        None
    }

    /// Called once after the component has been unpacked.
    async fn on_install(&self, _install_root: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before the component's files are removed.
    async fn on_uninstall(&self, _install_root: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Service unit deployment capability of a component.
#[async_trait]
pub trait ServiceUnitManager: Send + Sync + 'static {
    async fn deploy(&self, _unit: &str, _root: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    async fn init(&self, unit: &str, root: &Path) -> anyhow::Result<()>;

    async fn start(&self, unit: &str) -> anyhow::Result<()>;

    async fn stop(&self, unit: &str) -> anyhow::Result<()>;

    async fn shut_down(&self, unit: &str) -> anyhow::Result<()>;

    async fn undeploy(&self, _unit: &str, _root: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}
