//! Shared libraries: named, versioned resource bundles components depend on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::component::PluginScope;
use crate::descriptor::SharedLibraryDescriptor;
use crate::error::{JbiError, JbiResult};

#[derive(Debug)]
pub struct SharedLibrary {
    descriptor: SharedLibraryDescriptor,
    install_root: PathBuf,
    scope: Arc<PluginScope>,
}

impl SharedLibrary {
    pub fn new(descriptor: SharedLibraryDescriptor, install_root: PathBuf, scope: Arc<PluginScope>) -> Self {
        Self {
            descriptor,
            install_root,
            scope,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.descriptor.version.as_deref()
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    #[must_use]
    pub fn descriptor(&self) -> &SharedLibraryDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<PluginScope> {
        &self.scope
    }
}

#[derive(Default)]
pub struct SharedLibraryRegistry {
    libraries: RwLock<BTreeMap<String, Arc<SharedLibrary>>>,
}

impl SharedLibraryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `JbiError::SharedLibraryAlreadyInstalled` for a duplicate name.
    pub fn register(&self, library: Arc<SharedLibrary>) -> JbiResult<()> {
        let mut libraries = self.libraries.write();
        if libraries.contains_key(library.name()) {
            return Err(JbiError::SharedLibraryAlreadyInstalled(library.name().to_owned()));
        }
        tracing::debug!(library = %library.name(), version = ?library.version(), "shared library registered");
        libraries.insert(library.name().to_owned(), library);
        Ok(())
    }

    /// Remove a library; its scope is released.
    pub fn unregister(&self, name: &str) -> Option<Arc<SharedLibrary>> {
        let removed = self.libraries.write().remove(name)?;
        removed.scope.destroy();
        tracing::debug!(library = %name, "shared library unregistered");
        Some(removed)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<SharedLibrary>> {
        self.libraries.read().get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.libraries.read().contains_key(name)
    }

    #[must_use]
    pub fn libraries(&self) -> Vec<Arc<SharedLibrary>> {
        self.libraries.read().values().cloned().collect()
    }

    /// Names in `wanted` that are not registered, in input order.
    #[must_use]
    pub fn missing<'a>(&self, wanted: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let libraries = self.libraries.read();
        wanted
            .into_iter()
            .filter(|name| !libraries.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}
