//! Isolated resource scopes for components and shared libraries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Lookup order between a scope and its parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delegation {
    #[default]
    ParentFirst,
    SelfFirst,
}

/// Resource roots owned by one component or shared library, chained to the
/// scopes of the libraries it depends on.
///
/// A scope is exclusively owned by its record and released with [`destroy`](Self::destroy)
/// on uninstall; a destroyed scope resolves nothing.
#[derive(Debug)]
pub struct PluginScope {
    name: String,
    roots: Vec<PathBuf>,
    parents: Vec<Arc<PluginScope>>,
    delegation: Delegation,
    destroyed: AtomicBool,
}

impl PluginScope {
    pub fn new(
        name: impl Into<String>,
        roots: Vec<PathBuf>,
        parents: Vec<Arc<PluginScope>>,
        delegation: Delegation,
    ) -> Self {
        Self {
            name: name.into(),
            roots,
            parents,
            delegation,
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    #[must_use]
    pub fn parents(&self) -> &[Arc<PluginScope>] {
        &self.parents
    }

    #[must_use]
    pub fn delegation(&self) -> Delegation {
        self.delegation
    }

    /// Locate `relative` following the delegation order.
    #[must_use]
    pub fn find_resource(&self, relative: &Path) -> Option<PathBuf> {
        if self.is_destroyed() {
            return None;
        }
        match self.delegation {
            Delegation::ParentFirst => self
                .find_in_parents(relative)
                .or_else(|| self.find_own(relative)),
            Delegation::SelfFirst => self
                .find_own(relative)
                .or_else(|| self.find_in_parents(relative)),
        }
    }

    /// Effective search path, in lookup order.
    #[must_use]
    pub fn search_path(&self) -> Vec<PathBuf> {
        let parents = self.parents.iter().flat_map(|p| p.search_path());
        match self.delegation {
            Delegation::ParentFirst => parents.chain(self.roots.iter().cloned()).collect(),
            Delegation::SelfFirst => self.roots.iter().cloned().chain(parents).collect(),
        }
    }

    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!(scope = %self.name, "plugin scope released");
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn find_own(&self, relative: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.exists())
    }

    fn find_in_parents(&self, relative: &Path) -> Option<PathBuf> {
        self.parents.iter().find_map(|p| p.find_resource(relative))
    }
}
