//! On-disk state: running states of components and assemblies, and the
//! processed-file maps of the hot deploy monitor.
//!
//! Every document is pretty JSON with an explicit `version` field and is
//! written to a temporary sibling first, then renamed into place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{JbiError, JbiResult};
use crate::state::LifeCycleState;

pub const FORMAT_VERSION: u32 = 1;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    state: LifeCycleState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct MapDocument<T> {
    version: u32,
    entries: BTreeMap<String, T>,
}

/// Read a JSON document, `None` when the file does not exist.
///
/// # Errors
/// Returns `JbiError::Io` or `JbiError::Serialization`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> JbiResult<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(JbiError::io(path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| JbiError::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

/// Atomically replace `path` with the pretty JSON form of `value`.
///
/// # Errors
/// Returns `JbiError::Io` or `JbiError::Serialization`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> JbiResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| JbiError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| JbiError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|e| JbiError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| JbiError::io(path, e))
}

/// Running-state documents for components and service assemblies.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn component_dir(&self, component: &str) -> PathBuf {
        self.root.join("components").join(component)
    }

    #[must_use]
    pub fn assembly_dir(&self, assembly: &str) -> PathBuf {
        self.root.join("service-assemblies").join(assembly)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// # Errors
    /// Returns an error if the state file exists but cannot be read.
    pub fn component_state(&self, component: &str) -> JbiResult<Option<LifeCycleState>> {
        Self::read_state(&self.component_dir(component).join(STATE_FILE))
    }

    /// # Errors
    /// Returns an error if the state file cannot be written.
    pub fn set_component_state(&self, component: &str, state: LifeCycleState) -> JbiResult<()> {
        Self::write_state(&self.component_dir(component).join(STATE_FILE), state)
    }

    /// # Errors
    /// Returns an error if the state file exists but cannot be read.
    pub fn assembly_state(&self, assembly: &str) -> JbiResult<Option<LifeCycleState>> {
        Self::read_state(&self.assembly_dir(assembly).join(STATE_FILE))
    }

    /// # Errors
    /// Returns an error if the state file cannot be written.
    pub fn set_assembly_state(&self, assembly: &str, state: LifeCycleState) -> JbiResult<()> {
        Self::write_state(&self.assembly_dir(assembly).join(STATE_FILE), state)
    }

    /// Drop everything persisted for an assembly (undeploy).
    ///
    /// # Errors
    /// Returns `JbiError::Io` if the directory exists but cannot be removed.
    pub fn remove_assembly(&self, assembly: &str) -> JbiResult<()> {
        remove_dir_if_exists(&self.assembly_dir(assembly))
    }

    /// Load a persisted key/value map; an absent file is an empty map.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_map<T: DeserializeOwned>(&self, file: &str) -> JbiResult<BTreeMap<String, T>> {
        let doc: Option<MapDocument<T>> = read_json(&self.data_dir().join(file))?;
        Ok(doc.map(|d| d.entries).unwrap_or_default())
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_map<T: Serialize>(&self, file: &str, entries: BTreeMap<String, T>) -> JbiResult<()> {
        let doc = MapDocument {
            version: FORMAT_VERSION,
            entries,
        };
        write_json(&self.data_dir().join(file), &doc)
    }

    fn read_state(path: &Path) -> JbiResult<Option<LifeCycleState>> {
        Ok(read_json::<StateDocument>(path)?.map(|d| d.state))
    }

    fn write_state(path: &Path, state: LifeCycleState) -> JbiResult<()> {
        let doc = StateDocument {
            version: FORMAT_VERSION,
            state,
        };
        tracing::trace!(path = %path.display(), %state, "persisting running state");
        write_json(path, &doc)
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> JbiResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JbiError::io(path, e)),
    }
}
