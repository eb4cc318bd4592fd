//! Component and shared-library installation.
//!
//! Archives are unpacked into a staging directory, validated against the
//! registries, then moved to `<root>/components/<name>/version_<n>/install`
//! (or `<root>/shared-libraries/<name>/...`). Older versions are removed
//! once the new one is registered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::archive::StagedArchive;
use super::layout::{VersionedDir, child_dirs};
use crate::component::{ComponentParts, ComponentRecord, PluginLoader, PluginScope};
use crate::descriptor::{
    ComponentDescriptor, Descriptor, DescriptorParser, SharedLibraryDescriptor, read_descriptor,
};
use crate::error::{JbiError, JbiResult};
use crate::events::ComponentEventKind;
use crate::library::SharedLibrary;
use crate::naming::ComponentNameSpace;
use crate::persistence::remove_dir_if_exists;
use crate::registry::Registry;
use crate::state::LifeCycleState;

const INSTALL_DIR: &str = "install";
const WORKSPACE_DIR: &str = "workspace";

pub struct InstallationService {
    registry: Arc<Registry>,
    loader: Arc<dyn PluginLoader>,
    parser: Arc<dyn DescriptorParser>,
    lock: Mutex<()>,
}

impl InstallationService {
    pub fn new(registry: Arc<Registry>, loader: Arc<dyn PluginLoader>, parser: Arc<dyn DescriptorParser>) -> Self {
        Self {
            registry,
            loader,
            parser,
            lock: Mutex::new(()),
        }
    }

    /// Unpack an archive into the staging area and parse its descriptor.
    ///
    /// # Errors
    /// Returns archive, I/O or descriptor errors.
    pub fn stage(&self, source: &Path) -> JbiResult<StagedArchive> {
        StagedArchive::stage(source, &self.staging_root(), self.parser.as_ref())
    }

    /// Install a component from a zip file or exploded directory.
    ///
    /// When the component registry is already started, the new component is
    /// brought to its initial running state right away.
    ///
    /// # Errors
    /// `ComponentAlreadyInstalled`, `MissingDependencies` for unregistered
    /// shared libraries, plugin load or install-hook failures, archive errors.
    pub async fn install_component(&self, source: &Path) -> JbiResult<Arc<ComponentRecord>> {
        let staged = self.stage(source)?;
        self.install_staged_component(staged).await
    }

    /// # Errors
    /// See [`install_component`](Self::install_component).
    pub async fn install_staged_component(&self, staged: StagedArchive) -> JbiResult<Arc<ComponentRecord>> {
        let descriptor = match staged.descriptor() {
            Descriptor::Component(d) => d.clone(),
            other => return Err(unexpected(&staged, "component", other)),
        };
        let _guard = self.lock.lock().await;
        let name = descriptor.name.clone();
        if self.registry.components().contains(&name) {
            return Err(JbiError::ComponentAlreadyInstalled(name));
        }
        let missing = self.registry.libraries().missing(&descriptor.shared_libraries);
        if !missing.is_empty() {
            return Err(JbiError::MissingDependencies {
                entity: "component",
                name,
                missing,
            });
        }

        let layout = VersionedDir::new(self.registry.store().component_dir(&name));
        let (version, version_dir) = layout.next()?;
        let install_root = version_dir.join(INSTALL_DIR);
        staged.persist_to(&install_root)?;

        let record = match self.register_component(descriptor, &version_dir, true).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&version_dir) {
                    tracing::warn!(component = %name, error = %cleanup, "failed to clean up failed install");
                }
                return Err(e);
            }
        };
        layout.prune(version);
        tracing::info!(component = %name, version, "component installed");

        if self.registry.components().is_started().await {
            if let Err(e) = record.set_initial_running_state().await {
                tracing::warn!(component = %name, error = %e, "installed component could not be started");
                self.registry.add_pending_component(Arc::clone(&record));
            }
            self.registry.schedule_pending_check();
        }
        Ok(record)
    }

    /// Remove an installed component.
    ///
    /// The component must be shut down and carry no deployed service units.
    /// `force` shuts it down first and leaves its service assemblies in place;
    /// they come back when a component of the same name starts again.
    ///
    /// # Errors
    /// `ComponentNotFound`, `InvalidState`, `ComponentHasServiceUnits`, or the
    /// plugin's uninstall hook failure (ignored with `force`).
    pub async fn uninstall_component(&self, name: &str, force: bool) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        let record = self
            .registry
            .get_component(name)
            .ok_or_else(|| JbiError::ComponentNotFound(name.to_owned()))?;

        let state = record.state();
        if !matches!(state, LifeCycleState::Shutdown | LifeCycleState::Unknown) {
            if !force {
                return Err(JbiError::InvalidState {
                    entity: "component",
                    name: name.to_owned(),
                    task: "uninstall",
                    state,
                });
            }
            record.do_shut_down().await?;
        }
        let units = self.registry.get_deployed_service_units_for_component(name);
        if !units.is_empty() && !force {
            return Err(JbiError::ComponentHasServiceUnits {
                component: name.to_owned(),
                units: units.iter().map(|u| u.key()).collect(),
            });
        }

        if let Err(e) = record.plugin().on_uninstall(record.install_root()).await {
            let err = JbiError::plugin(name, "uninstall", e);
            if !force {
                return Err(err);
            }
            tracing::warn!(component = %name, error = %err, "uninstall hook failed; continuing");
        }

        self.registry.deregister_component(name);
        record.scope().destroy();
        remove_dir_if_exists(&self.registry.store().component_dir(name))?;
        tracing::info!(component = %name, "component uninstalled");
        self.registry
            .events()
            .fire_component(name, ComponentEventKind::Uninstalled);
        Ok(())
    }

    /// # Errors
    /// `SharedLibraryAlreadyInstalled` or archive/descriptor errors.
    pub async fn install_shared_library(&self, source: &Path) -> JbiResult<Arc<SharedLibrary>> {
        let staged = self.stage(source)?;
        self.install_staged_shared_library(staged).await
    }

    /// # Errors
    /// See [`install_shared_library`](Self::install_shared_library).
    pub async fn install_staged_shared_library(&self, staged: StagedArchive) -> JbiResult<Arc<SharedLibrary>> {
        let descriptor = match staged.descriptor() {
            Descriptor::SharedLibrary(d) => d.clone(),
            other => return Err(unexpected(&staged, "shared library", other)),
        };
        let _guard = self.lock.lock().await;
        let name = descriptor.name.clone();
        if self.registry.libraries().contains(&name) {
            return Err(JbiError::SharedLibraryAlreadyInstalled(name));
        }

        let layout = VersionedDir::new(self.library_dir(&name));
        let (version, version_dir) = layout.next()?;
        let install_root = version_dir.join(INSTALL_DIR);
        staged.persist_to(&install_root)?;

        let library = Arc::new(Self::build_library(descriptor, install_root));
        if let Err(e) = self.registry.libraries().register(Arc::clone(&library)) {
            if let Err(cleanup) = remove_dir_if_exists(&version_dir) {
                tracing::warn!(library = %name, error = %cleanup, "failed to clean up failed install");
            }
            return Err(e);
        }
        layout.prune(version);
        tracing::info!(library = %name, version = ?library.version(), "shared library installed");
        Ok(library)
    }

    /// Remove a shared library.
    ///
    /// Refused while a component that is not shut down references it, unless `force`.
    ///
    /// # Errors
    /// `SharedLibraryNotFound` or `SharedLibraryInUse`.
    pub async fn uninstall_shared_library(&self, name: &str, force: bool) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        if !self.registry.libraries().contains(name) {
            return Err(JbiError::SharedLibraryNotFound(name.to_owned()));
        }
        if let Some(user) = self.registry.components().components().into_iter().find(|c| {
            c.shared_libraries().iter().any(|l| l == name)
                && !matches!(c.state(), LifeCycleState::Shutdown | LifeCycleState::Unknown)
        }) {
            if !force {
                return Err(JbiError::SharedLibraryInUse {
                    library: name.to_owned(),
                    component: user.name().to_owned(),
                });
            }
            tracing::warn!(library = %name, component = %user.name(), "removing a shared library still in use");
        }
        self.registry.libraries().unregister(name);
        remove_dir_if_exists(&self.library_dir(name))?;
        tracing::info!(library = %name, "shared library uninstalled");
        Ok(())
    }

    /// Re-register the latest installed version of every shared library and
    /// component found on disk. Components keep the `SHUTDOWN` state until the
    /// component registry starts.
    ///
    /// Entries that cannot be restored are logged and skipped.
    ///
    /// # Errors
    /// Returns `JbiError::Io` if the install directories cannot be listed.
    pub async fn restore(&self) -> JbiResult<()> {
        let _guard = self.lock.lock().await;
        for dir in child_dirs(&self.registry.store().root().join("shared-libraries"))? {
            if let Err(e) = self.restore_library(&dir) {
                tracing::error!(dir = %dir.display(), error = %e, "failed to restore shared library");
            }
        }
        for dir in child_dirs(&self.registry.store().root().join("components"))? {
            if let Err(e) = self.restore_component(&dir).await {
                tracing::error!(dir = %dir.display(), error = %e, "failed to restore component");
            }
        }
        Ok(())
    }

    fn restore_library(&self, dir: &Path) -> JbiResult<()> {
        let Some(version_dir) = VersionedDir::new(dir.to_path_buf()).latest()? else {
            return Ok(());
        };
        let install_root = version_dir.join(INSTALL_DIR);
        let descriptor = match read_descriptor(self.parser.as_ref(), &install_root)? {
            Descriptor::SharedLibrary(d) => d,
            other => return Err(mismatch(&install_root, "shared library", &other)),
        };
        let library = Arc::new(Self::build_library(descriptor, install_root));
        self.registry.libraries().register(Arc::clone(&library))?;
        tracing::debug!(library = %library.name(), "shared library restored");
        Ok(())
    }

    async fn restore_component(&self, dir: &Path) -> JbiResult<()> {
        let Some(version_dir) = VersionedDir::new(dir.to_path_buf()).latest()? else {
            return Ok(());
        };
        let install_root = version_dir.join(INSTALL_DIR);
        let descriptor = match read_descriptor(self.parser.as_ref(), &install_root)? {
            Descriptor::Component(d) => d,
            other => return Err(mismatch(&install_root, "component", &other)),
        };
        let missing = self.registry.libraries().missing(&descriptor.shared_libraries);
        if !missing.is_empty() {
            return Err(JbiError::MissingDependencies {
                entity: "component",
                name: descriptor.name,
                missing,
            });
        }
        let record = self.register_component(descriptor, &version_dir, false).await?;
        tracing::debug!(component = %record.name(), "component restored");
        Ok(())
    }

    /// Load the plugin and register the record in `SHUTDOWN`.
    async fn register_component(
        &self,
        descriptor: ComponentDescriptor,
        version_dir: &Path,
        fresh: bool,
    ) -> JbiResult<Arc<ComponentRecord>> {
        let install_root = version_dir.join(INSTALL_DIR);
        let workspace_root = version_dir.join(WORKSPACE_DIR);
        std::fs::create_dir_all(&workspace_root).map_err(|e| JbiError::io(&workspace_root, e))?;

        let parents = descriptor
            .shared_libraries
            .iter()
            .filter_map(|name| self.registry.libraries().get(name))
            .map(|library| Arc::clone(library.scope()))
            .collect();
        let scope = Arc::new(PluginScope::new(
            descriptor.name.clone(),
            scope_roots(&install_root, &descriptor.class_path),
            parents,
            descriptor.delegation,
        ));
        let plugin = self.loader.load(&descriptor, &scope)?;
        if fresh {
            plugin
                .on_install(&install_root)
                .await
                .map_err(|e| JbiError::plugin(&descriptor.name, "install", e))?;
        }

        let name = descriptor.name.clone();
        let record = self.registry.register_component(ComponentParts {
            namespace: ComponentNameSpace::new(self.registry.container_name(), &name),
            descriptor,
            plugin,
            scope,
            install_root,
            workspace_root,
            pojo: false,
        })?;
        record.mark_installed();
        self.registry
            .events()
            .fire_component(&name, ComponentEventKind::Installed);
        Ok(record)
    }

    fn build_library(descriptor: SharedLibraryDescriptor, install_root: PathBuf) -> SharedLibrary {
        let scope = Arc::new(PluginScope::new(
            descriptor.name.clone(),
            scope_roots(&install_root, &descriptor.class_path),
            Vec::new(),
            descriptor.delegation,
        ));
        SharedLibrary::new(descriptor, install_root, scope)
    }

    fn library_dir(&self, name: &str) -> PathBuf {
        self.registry.store().root().join("shared-libraries").join(name)
    }

    fn staging_root(&self) -> PathBuf {
        self.registry.store().root().join("tmp")
    }
}

/// Class-path entries resolved against the install root; the root itself when empty.
fn scope_roots(install_root: &Path, class_path: &[String]) -> Vec<PathBuf> {
    if class_path.is_empty() {
        return vec![install_root.to_path_buf()];
    }
    class_path.iter().map(|entry| install_root.join(entry)).collect()
}

fn unexpected(staged: &StagedArchive, expected: &str, found: &Descriptor) -> JbiError {
    mismatch(staged.source(), expected, found)
}

fn mismatch(path: &Path, expected: &str, found: &Descriptor) -> JbiError {
    JbiError::InvalidDescriptor {
        path: path.to_path_buf(),
        reason: format!("expected a {expected} descriptor, found a {} descriptor", found.kind()),
    }
}
