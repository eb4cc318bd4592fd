//! Service assembly deployment.
//!
//! An assembly is unpacked to `<root>/service-assemblies/<name>/install`; each
//! of its units to `<root>/service-assemblies/<name>/sus/<component>/<unit>`,
//! where the target component's service unit manager picks it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::archive::{StagedArchive, unpack};
use super::layout::child_dirs;
use crate::assembly::{ServiceAssemblyLifeCycle, ServiceUnitLifeCycle};
use crate::descriptor::{
    Descriptor, DescriptorParser, ServiceAssemblyDescriptor, ServicesDescriptor, read_descriptor,
};
use crate::error::{JbiError, JbiResult};
use crate::events::DeploymentEventKind;
use crate::persistence::remove_dir_if_exists;
use crate::registry::Registry;
use crate::state::LifeCycleState;

const INSTALL_DIR: &str = "install";
const UNITS_DIR: &str = "sus";

pub struct DeploymentService {
    registry: Arc<Registry>,
    parser: Arc<dyn DescriptorParser>,
    lock: Mutex<()>,
}

impl DeploymentService {
    pub fn new(registry: Arc<Registry>, parser: Arc<dyn DescriptorParser>) -> Self {
        Self {
            registry,
            parser,
            lock: Mutex::new(()),
        }
    }

    /// Unpack an archive into the staging area and parse its descriptor.
    ///
    /// # Errors
    /// Returns archive, I/O or descriptor errors.
    pub fn stage(&self, source: &Path) -> JbiResult<StagedArchive> {
        StagedArchive::stage(
            source,
            &self.registry.store().root().join("tmp"),
            self.parser.as_ref(),
        )
    }

    /// Deploy a service assembly from a zip file or exploded directory.
    ///
    /// The assembly is registered in `SHUTDOWN`.
    ///
    /// # Errors
    /// See [`deploy_staged`](Self::deploy_staged).
    pub async fn deploy(&self, source: &Path) -> JbiResult<Arc<ServiceAssemblyLifeCycle>> {
        let staged = self.stage(source)?;
        self.deploy_staged(staged).await
    }

    /// Deploy a staged service assembly.
    ///
    /// Every target component must be installed and started. Units are handed
    /// to their components one by one; if any deploy fails, the units already
    /// deployed are undeployed again and nothing is registered.
    ///
    /// # Errors
    /// `AssemblyAlreadyDeployed`, `MissingDependencies`, `InvalidState` for a
    /// target component that is not started, unit deployment failures.
    pub async fn deploy_staged(&self, staged: StagedArchive) -> JbiResult<Arc<ServiceAssemblyLifeCycle>> {
        let descriptor = match staged.descriptor() {
            Descriptor::ServiceAssembly(d) => d.clone(),
            other => {
                return Err(JbiError::InvalidDescriptor {
                    path: staged.source().to_path_buf(),
                    reason: format!(
                        "expected a service assembly descriptor, found a {} descriptor",
                        other.kind()
                    ),
                });
            }
        };
        let _guard = self.lock.lock().await;
        let name = descriptor.name.clone();
        if self.registry.assemblies().contains(&name) {
            return Err(JbiError::AssemblyAlreadyDeployed(name));
        }
        self.check_targets(&descriptor)?;

        let assembly_dir = self.registry.store().assembly_dir(&name);
        let install_root = assembly_dir.join(INSTALL_DIR);
        staged.persist_to(&install_root)?;

        match self.deploy_units(&descriptor, &assembly_dir, &install_root).await {
            Ok(units) => {
                let assembly = Arc::new(ServiceAssemblyLifeCycle::new(
                    descriptor,
                    install_root,
                    units,
                    &self.registry,
                ));
                self.registry.assemblies().register(Arc::clone(&assembly))?;
                assembly.persist_state(&self.registry)?;
                tracing::info!(assembly = %name, units = assembly.units().len(), "service assembly deployed");
                self.registry
                    .events()
                    .fire_assembly(&name, DeploymentEventKind::Deployed);
                Ok(assembly)
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&assembly_dir) {
                    tracing::warn!(assembly = %name, error = %cleanup, "failed to clean up failed deployment");
                }
                Err(e)
            }
        }
    }

    /// Remove a shut-down service assembly.
    ///
    /// Connection aliases left behind are dropped and units that are still
    /// initialised are shut down before they are undeployed. Units whose
    /// component is neither started nor stopped are skipped with a warning.
    /// Unit failures abort the undeploy unless `force` is set.
    ///
    /// # Errors
    /// `AssemblyNotFound`, `InvalidState`, or a composite of unit failures.
    pub async fn undeploy(&self, name: &str, force: bool) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        let assembly = self.get(name)?;
        let state = assembly.state();
        if !state.is_shut_down() {
            return Err(JbiError::InvalidState {
                entity: "service assembly",
                name: name.to_owned(),
                task: "undeploy",
                state,
            });
        }
        assembly.release_connections().await?;

        let mut failures = Vec::new();
        for unit in assembly.units() {
            let running = self
                .registry
                .get_component(unit.component_name())
                .is_some_and(|c| c.is_started() || c.is_stopped());
            if !running {
                tracing::warn!(assembly = %name, unit = %unit.key(), "component not running; skipping unit undeploy");
                continue;
            }
            if let Err(e) = Self::shut_down_unit(unit).await {
                failures.push(e);
                continue;
            }
            if let Err(e) = unit.undeploy().await {
                failures.push(e);
            }
        }
        if !failures.is_empty() {
            if !force {
                return Err(JbiError::Composite {
                    task: "undeploy",
                    assembly: name.to_owned(),
                    failures,
                });
            }
            tracing::warn!(assembly = %name, failures = failures.len(), "unit undeploy failures ignored");
        }

        self.registry.assemblies().unregister(name);
        self.registry.remove_pending_assembly(name);
        self.registry.store().remove_assembly(name)?;
        tracing::info!(assembly = %name, "service assembly undeployed");
        self.registry
            .events()
            .fire_assembly(name, DeploymentEventKind::Undeployed);
        Ok(())
    }

    /// # Errors
    /// `AssemblyNotFound` or the transition's failure.
    pub async fn start(&self, name: &str) -> JbiResult<()> {
        self.get(name)?.start(true).await
    }

    /// # Errors
    /// `AssemblyNotFound` or the transition's failure.
    pub async fn stop(&self, name: &str) -> JbiResult<()> {
        self.get(name)?.stop(true, false).await
    }

    /// # Errors
    /// `AssemblyNotFound` or the transition's failure.
    pub async fn shut_down(&self, name: &str) -> JbiResult<()> {
        self.get(name)?.shut_down(true).await
    }

    /// # Errors
    /// `AssemblyNotFound`.
    pub fn state(&self, name: &str) -> JbiResult<LifeCycleState> {
        Ok(self.get(name)?.state())
    }

    /// Re-register every assembly found on disk in `SHUTDOWN`.
    ///
    /// Units are not deployed again; their persisted state is replayed once
    /// the target components start.
    ///
    /// # Errors
    /// Returns `JbiError::Io` if the assemblies directory cannot be listed.
    pub async fn restore(&self) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        for dir in child_dirs(&self.registry.store().root().join("service-assemblies"))? {
            if let Err(e) = self.restore_assembly(&dir) {
                tracing::error!(dir = %dir.display(), error = %e, "failed to restore service assembly");
            }
        }
        Ok(())
    }

    /// Shut every assembly down without touching its persisted state.
    pub async fn shut_down_all(&self) {
        for assembly in self.registry.assemblies().assemblies().iter().rev() {
            if assembly.is_shut_down() {
                continue;
            }
            if let Err(e) = assembly.shut_down(false).await {
                tracing::warn!(assembly = %assembly.name(), error = %e, "failed to shut down service assembly");
            }
        }
    }

    fn restore_assembly(&self, dir: &Path) -> JbiResult<()> {
        let install_root = dir.join(INSTALL_DIR);
        if !install_root.is_dir() {
            return Ok(());
        }
        let descriptor = match read_descriptor(self.parser.as_ref(), &install_root)? {
            Descriptor::ServiceAssembly(d) => d,
            other => {
                return Err(JbiError::InvalidDescriptor {
                    path: install_root,
                    reason: format!("expected a service assembly descriptor, found a {} descriptor", other.kind()),
                });
            }
        };
        let units = descriptor
            .units
            .iter()
            .map(|unit| -> JbiResult<Arc<ServiceUnitLifeCycle>> {
                let root = unit_root(dir, &unit.component, &unit.name);
                let services = self.unit_services(&root)?;
                Ok(Arc::new(ServiceUnitLifeCycle::new(
                    unit.clone(),
                    descriptor.name.clone(),
                    root,
                    services,
                    &self.registry,
                )))
            })
            .collect::<JbiResult<Vec<_>>>()?;
        let name = descriptor.name.clone();
        let assembly = Arc::new(ServiceAssemblyLifeCycle::new(
            descriptor,
            install_root,
            units,
            &self.registry,
        ));
        self.registry.assemblies().register(assembly)?;
        tracing::debug!(assembly = %name, "service assembly restored");
        Ok(())
    }

    fn check_targets(&self, descriptor: &ServiceAssemblyDescriptor) -> JbiResult<()> {
        let targets = descriptor.target_components();
        let missing: Vec<String> = targets
            .iter()
            .filter(|c| !self.registry.components().contains(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(JbiError::MissingDependencies {
                entity: "service assembly",
                name: descriptor.name.clone(),
                missing,
            });
        }
        for target in &targets {
            if let Some(component) = self.registry.get_component(target)
                && !component.is_started()
            {
                return Err(JbiError::InvalidState {
                    entity: "component",
                    name: target.clone(),
                    task: "deploy to",
                    state: component.state(),
                });
            }
        }
        Ok(())
    }

    async fn deploy_units(
        &self,
        descriptor: &ServiceAssemblyDescriptor,
        assembly_dir: &Path,
        install_root: &Path,
    ) -> JbiResult<Vec<Arc<ServiceUnitLifeCycle>>> {
        let mut deployed: Vec<Arc<ServiceUnitLifeCycle>> = Vec::new();
        for unit in &descriptor.units {
            let root = unit_root(assembly_dir, &unit.component, &unit.name);
            let prepared = unpack(&install_root.join(&unit.artifact), &root)
                .and_then(|()| self.unit_services(&root))
                .map(|services| {
                    Arc::new(ServiceUnitLifeCycle::new(
                        unit.clone(),
                        descriptor.name.clone(),
                        root,
                        services,
                        &self.registry,
                    ))
                });
            let result = match prepared {
                Ok(lifecycle) => lifecycle.deploy().await.map(|()| lifecycle),
                Err(e) => Err(e),
            };
            match result {
                Ok(lifecycle) => deployed.push(lifecycle),
                Err(e) => {
                    for done in deployed.iter().rev() {
                        if let Err(undo) = done.undeploy().await {
                            tracing::warn!(unit = %done.key(), error = %undo, "rollback undeploy failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(deployed)
    }

    /// Bring a unit left initialised by a failed transition back to `SHUTDOWN`.
    async fn shut_down_unit(unit: &ServiceUnitLifeCycle) -> JbiResult<()> {
        if unit.state().is_started() {
            unit.stop().await?;
        }
        if unit.state().is_stopped() {
            tracing::debug!(unit = %unit.key(), "shutting down service unit before undeploy");
            unit.shut_down().await?;
        }
        Ok(())
    }

    /// Services descriptor of an unpacked unit; units without one are accepted.
    fn unit_services(&self, root: &Path) -> JbiResult<Option<ServicesDescriptor>> {
        match read_descriptor(self.parser.as_ref(), root) {
            Ok(Descriptor::Services(services)) => Ok(Some(services)),
            Ok(other) => {
                tracing::warn!(unit = %root.display(), kind = other.kind(), "unexpected descriptor in service unit ignored");
                Ok(None)
            }
            Err(JbiError::DescriptorNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get(&self, name: &str) -> JbiResult<Arc<ServiceAssemblyLifeCycle>> {
        self.registry
            .get_service_assembly(name)
            .ok_or_else(|| JbiError::AssemblyNotFound(name.to_owned()))
    }
}

fn unit_root(assembly_dir: &Path, component: &str, unit: &str) -> PathBuf {
    assembly_dir.join(UNITS_DIR).join(component).join(unit)
}
