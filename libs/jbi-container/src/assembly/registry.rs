use std::sync::Arc;

use parking_lot::RwLock;

use super::{ServiceAssemblyLifeCycle, ServiceUnitLifeCycle};
use crate::error::{JbiError, JbiResult};

/// Deployed service assemblies in deployment order.
#[derive(Default)]
pub struct ServiceAssemblyRegistry {
    assemblies: RwLock<Vec<Arc<ServiceAssemblyLifeCycle>>>,
}

impl ServiceAssemblyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `JbiError::AssemblyAlreadyDeployed` for a duplicate name.
    pub fn register(&self, assembly: Arc<ServiceAssemblyLifeCycle>) -> JbiResult<()> {
        let mut assemblies = self.assemblies.write();
        if assemblies.iter().any(|a| a.name() == assembly.name()) {
            return Err(JbiError::AssemblyAlreadyDeployed(assembly.name().to_owned()));
        }
        tracing::debug!(assembly = %assembly.name(), units = assembly.units().len(), "service assembly registered");
        assemblies.push(assembly);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<ServiceAssemblyLifeCycle>> {
        let mut assemblies = self.assemblies.write();
        let pos = assemblies.iter().position(|a| a.name() == name)?;
        tracing::debug!(assembly = %name, "service assembly unregistered");
        Some(assemblies.remove(pos))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ServiceAssemblyLifeCycle>> {
        self.assemblies
            .read()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.assemblies.read().iter().any(|a| a.name() == name)
    }

    #[must_use]
    pub fn assemblies(&self) -> Vec<Arc<ServiceAssemblyLifeCycle>> {
        self.assemblies.read().clone()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.assemblies
            .read()
            .iter()
            .map(|a| a.name().to_owned())
            .collect()
    }

    /// Assemblies with at least one unit deployed to `component`.
    #[must_use]
    pub fn get_for_component(&self, component: &str) -> Vec<Arc<ServiceAssemblyLifeCycle>> {
        self.assemblies
            .read()
            .iter()
            .filter(|a| a.targets_component(component))
            .cloned()
            .collect()
    }

    /// Units deployed to `component`, across all assemblies.
    #[must_use]
    pub fn units_for_component(&self, component: &str) -> Vec<Arc<ServiceUnitLifeCycle>> {
        self.assemblies
            .read()
            .iter()
            .flat_map(|a| a.units().iter())
            .filter(|u| u.component_name() == component)
            .cloned()
            .collect()
    }

    /// Unit by `component/unit` key.
    #[must_use]
    pub fn get_unit(&self, key: &str) -> Option<Arc<ServiceUnitLifeCycle>> {
        self.assemblies
            .read()
            .iter()
            .flat_map(|a| a.units().iter())
            .find(|u| u.key() == key)
            .cloned()
    }
}
