//! Versioned install directories: `<base>/version_<n>/{install,workspace}`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{JbiError, JbiResult};
use crate::persistence::remove_dir_if_exists;

const VERSION_PREFIX: &str = "version_";

#[derive(Debug, Clone)]
pub(crate) struct VersionedDir {
    base: PathBuf,
}

impl VersionedDir {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub(crate) fn version_dir(&self, version: u32) -> PathBuf {
        self.base.join(format!("{VERSION_PREFIX}{version}"))
    }

    /// Installed versions, ascending.
    pub(crate) fn versions(&self) -> JbiResult<Vec<u32>> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JbiError::io(&self.base, e)),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| JbiError::io(&self.base, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(VERSION_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub(crate) fn latest(&self) -> JbiResult<Option<PathBuf>> {
        Ok(self.versions()?.last().map(|v| self.version_dir(*v)))
    }

    /// Directory for the next install; not created.
    pub(crate) fn next(&self) -> JbiResult<(u32, PathBuf)> {
        let version = self.versions()?.last().map_or(1, |v| v + 1);
        Ok((version, self.version_dir(version)))
    }

    /// Remove every version but `keep`. Failures are logged.
    pub(crate) fn prune(&self, keep: u32) {
        let Ok(versions) = self.versions() else {
            return;
        };
        for version in versions.into_iter().filter(|v| *v != keep) {
            let dir = self.version_dir(version);
            if let Err(e) = remove_dir_if_exists(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove old install version");
            }
        }
    }
}

/// Sub-directories of `dir`, sorted by name; empty when `dir` does not exist.
pub(crate) fn child_dirs(dir: &Path) -> JbiResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(JbiError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| JbiError::io(dir, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn versions_increase_and_prune_keeps_one() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VersionedDir::new(dir.path().join("c1"));
        assert_eq!(layout.latest().unwrap(), None);

        let (v1, d1) = layout.next().unwrap();
        assert_eq!(v1, 1);
        fs::create_dir_all(&d1).unwrap();
        let (v2, d2) = layout.next().unwrap();
        assert_eq!(v2, 2);
        fs::create_dir_all(&d2).unwrap();
        fs::write(dir.path().join("c1/state.json"), "{}").unwrap();

        assert_eq!(layout.versions().unwrap(), [1, 2]);
        layout.prune(2);
        assert_eq!(layout.versions().unwrap(), [2]);
        assert_eq!(layout.latest().unwrap(), Some(d2));
    }
}
