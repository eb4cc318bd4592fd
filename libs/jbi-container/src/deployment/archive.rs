//! Archive handling: unpacking zip files or exploded directories, integrity
//! probing and the processed-file records of the hot deploy monitor.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::{Descriptor, DescriptorParser, read_descriptor};
use crate::error::{JbiError, JbiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    SharedLibrary,
    Component,
    ServiceAssembly,
}

impl ArchiveKind {
    /// Kind of a deployable descriptor; `None` for a service-unit descriptor.
    #[must_use]
    pub fn of(descriptor: &Descriptor) -> Option<Self> {
        match descriptor {
            Descriptor::SharedLibrary(_) => Some(Self::SharedLibrary),
            Descriptor::Component(_) => Some(Self::Component),
            Descriptor::ServiceAssembly(_) => Some(Self::ServiceAssembly),
            Descriptor::Services(_) => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SharedLibrary => "shared library",
            Self::Component => "component",
            Self::ServiceAssembly => "service assembly",
        }
    }
}

/// One processed archive of a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub location: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub kind: ArchiveKind,
    pub name: String,
    /// Waiting for `dependencies`; never persisted.
    #[serde(skip)]
    pub pending: bool,
    /// Shared libraries of a component, target components of an assembly.
    #[serde(skip)]
    pub dependencies: Vec<String>,
}

/// Unpacked copy of an archive with its parsed descriptor.
///
/// The staging directory is removed on drop unless it was moved into place
/// with [`persist_to`](Self::persist_to).
#[derive(Debug)]
pub struct StagedArchive {
    source: PathBuf,
    dir: PathBuf,
    descriptor: Descriptor,
}

impl StagedArchive {
    /// Unpack `source` under `staging_root`, then parse and validate its descriptor.
    ///
    /// # Errors
    /// Returns archive, I/O or descriptor errors.
    pub fn stage(source: &Path, staging_root: &Path, parser: &dyn DescriptorParser) -> JbiResult<Self> {
        let dir = staging_root.join(Uuid::now_v7().to_string());
        let descriptor = unpack(source, &dir).and_then(|()| read_descriptor(parser, &dir));
        let descriptor = match descriptor {
            Ok(descriptor) => descriptor,
            Err(e) => {
                discard(&dir);
                return Err(e);
            }
        };
        tracing::debug!(source = %source.display(), kind = descriptor.kind(), "archive staged");
        Ok(Self {
            source: source.to_path_buf(),
            dir,
            descriptor,
        })
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Move the unpacked content to `dest`, replacing whatever is there.
    ///
    /// # Errors
    /// Returns `JbiError::Io` if the content cannot be moved or copied.
    pub fn persist_to(self, dest: &Path) -> JbiResult<()> {
        crate::persistence::remove_dir_if_exists(dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| JbiError::io(parent, e))?;
        }
        if fs::rename(&self.dir, dest).is_err() {
            copy_dir(&self.dir, dest)?;
        }
        Ok(())
    }
}

impl Drop for StagedArchive {
    fn drop(&mut self) {
        discard(&self.dir);
    }
}

fn discard(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(dir = %dir.display(), error = %e, "failed to remove staging directory");
    }
}

/// Unpack a zip file, or copy an exploded directory, into `dest`.
///
/// # Errors
/// Returns `JbiError::Archive` for a broken zip and `JbiError::Io` otherwise.
pub fn unpack(source: &Path, dest: &Path) -> JbiResult<()> {
    if source.is_dir() {
        return copy_dir(source, dest);
    }
    let file = File::open(source).map_err(|e| JbiError::io(source, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_error(source, e))?;
    fs::create_dir_all(dest).map_err(|e| JbiError::io(dest, e))?;
    archive.extract(dest).map_err(|e| archive_error(source, e))
}

/// Whether `path` can be opened as a zip and every entry size read.
///
/// Directories always pass. A file still being written usually fails here.
#[must_use]
pub fn is_complete(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(mut archive) = zip::ZipArchive::new(file) else {
        return false;
    };
    (0..archive.len()).all(|i| archive.by_index(i).map(|entry| entry.size()).is_ok())
}

/// Modification time of a file or directory.
///
/// # Errors
/// Returns `JbiError::Io` if the metadata cannot be read.
pub fn last_modified(path: &Path) -> JbiResult<DateTime<Utc>> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| JbiError::io(path, e))?;
    Ok(DateTime::<Utc>::from(modified))
}

fn copy_dir(source: &Path, dest: &Path) -> JbiResult<()> {
    fs::create_dir_all(dest).map_err(|e| JbiError::io(dest, e))?;
    for entry in fs::read_dir(source).map_err(|e| JbiError::io(source, e))? {
        let entry = entry.map_err(|e| JbiError::io(source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| JbiError::io(&from, e))?;
        }
    }
    Ok(())
}

fn archive_error(path: &Path, source: zip::result::ZipError) -> JbiError {
    JbiError::Archive {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::descriptor::JsonDescriptorParser;
    use std::io::Write;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn stages_a_zip_and_cleans_up_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("lib.zip");
        write_zip(
            &archive,
            &[(
                "META-INF/jbi.json",
                r#"{"shared_library": {"name": "lib1", "version": "1.0"}}"#,
            )],
        );

        let staging = dir.path().join("tmp");
        let staged = StagedArchive::stage(&archive, &staging, &JsonDescriptorParser).unwrap();
        assert_eq!(ArchiveKind::of(staged.descriptor()), Some(ArchiveKind::SharedLibrary));
        let staged_dir = staged.dir().to_path_buf();
        assert!(staged_dir.join("META-INF/jbi.json").is_file());

        drop(staged);
        assert!(!staged_dir.exists());
    }

    #[test]
    fn persist_moves_content_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let exploded = dir.path().join("exploded");
        fs::create_dir_all(exploded.join("META-INF")).unwrap();
        fs::write(
            exploded.join("META-INF/jbi.json"),
            r#"{"component": {"name": "c1", "class": "acme.Engine"}}"#,
        )
        .unwrap();
        fs::write(exploded.join("data.txt"), "x").unwrap();

        let staged = StagedArchive::stage(&exploded, &dir.path().join("tmp"), &JsonDescriptorParser).unwrap();
        let dest = dir.path().join("installed");
        staged.persist_to(&dest).unwrap();

        assert!(dest.join("data.txt").is_file());
        assert!(exploded.join("data.txt").is_file());
    }

    #[test]
    fn truncated_zip_fails_the_probe() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("partial.zip");
        write_zip(&archive, &[("a.txt", "hello world")]);
        assert!(is_complete(&archive));

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();
        assert!(!is_complete(&archive));
    }

    #[test]
    fn entry_runtime_fields_are_not_serialized() {
        let entry = ArchiveEntry {
            location: PathBuf::from("/deploy/sa.zip"),
            last_modified: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            kind: ArchiveKind::ServiceAssembly,
            name: "sa".to_owned(),
            pending: true,
            dependencies: vec!["c1".to_owned()],
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["kind"], "service_assembly");
        assert!(value.get("pending").is_none());
        assert!(value.get("dependencies").is_none());
    }
}
