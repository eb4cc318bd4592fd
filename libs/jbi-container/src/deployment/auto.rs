//! Directory based hot deployment.
//!
//! Archives dropped into the install directory (components, shared
//! libraries) or the deploy directory (service assemblies) are processed once
//! their size is stable across two polls and they pass the zip probe.
//! Archives whose prerequisites are missing stay pending and are retried each
//! time another archive is installed. Removing a file uninstalls or
//! undeploys what it brought in.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::archive::{self, ArchiveEntry, ArchiveKind};
use super::{DeploymentService, InstallationService};
use crate::descriptor::Descriptor;
use crate::error::{JbiError, JbiResult};
use crate::executor::PollingTask;
use crate::registry::Registry;

/// Processed-file map of the install directory.
pub const INSTALL_MAP: &str = "install.files.json";
/// Processed-file map of the deploy directory.
pub const DEPLOY_MAP: &str = "deploy.files.json";

#[derive(Debug, Default)]
struct Tracking {
    entries: BTreeMap<PathBuf, ArchiveEntry>,
    /// Size seen at the previous poll, for files not processed yet.
    sizes: HashMap<PathBuf, u64>,
    /// Files that failed processing, retried once modified again.
    failed: HashMap<PathBuf, DateTime<Utc>>,
}

pub struct AutoDeploymentService {
    registry: Arc<Registry>,
    installation: Arc<InstallationService>,
    deployment: Arc<DeploymentService>,
    install_dir: PathBuf,
    deploy_dir: PathBuf,
    tracking: Mutex<Tracking>,
    monitor: parking_lot::Mutex<Option<PollingTask>>,
}

impl AutoDeploymentService {
    pub fn new(
        registry: Arc<Registry>,
        installation: Arc<InstallationService>,
        deployment: Arc<DeploymentService>,
    ) -> Self {
        let install_dir = registry.config().install_dir();
        let deploy_dir = registry.config().deploy_dir();
        Self {
            registry,
            installation,
            deployment,
            install_dir,
            deploy_dir,
            tracking: Mutex::new(Tracking::default()),
            monitor: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    #[must_use]
    pub fn deploy_dir(&self) -> &Path {
        &self.deploy_dir
    }

    /// Load the processed-file maps written by a previous run.
    ///
    /// # Errors
    /// Returns an error if a map exists but cannot be read.
    pub async fn load_maps(&self) -> JbiResult<()> {
        let mut tracking = self.tracking.lock().await;
        for file in [INSTALL_MAP, DEPLOY_MAP] {
            for entry in self.registry.store().load_map::<ArchiveEntry>(file)?.into_values() {
                tracking.entries.insert(entry.location.clone(), entry);
            }
        }
        tracing::debug!(entries = tracking.entries.len(), "hot deploy file maps loaded");
        Ok(())
    }

    /// Every tracked archive, pending ones included.
    pub async fn entries(&self) -> Vec<ArchiveEntry> {
        self.tracking.lock().await.entries.values().cloned().collect()
    }

    /// Archives waiting for their dependencies.
    pub async fn pending_entries(&self) -> Vec<ArchiveEntry> {
        self.tracking
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.pending)
            .cloned()
            .collect()
    }

    /// Install or deploy the archive at `location`, replacing an existing
    /// entity of the same name.
    ///
    /// An archive with missing prerequisites is recorded as pending and
    /// returned with `pending = true`. Every successful install retries the
    /// pending archives whose prerequisites are now present.
    ///
    /// # Errors
    /// Archive, descriptor, installation or deployment failures.
    pub async fn update_archive(&self, location: &Path) -> JbiResult<ArchiveEntry> {
        let mut tracking = self.tracking.lock().await;
        self.update_locked(&mut tracking, location).await
    }

    /// Forget the archive at `location` and uninstall or undeploy what it
    /// brought in. Unknown locations are ignored.
    ///
    /// # Errors
    /// The uninstall or undeploy failure; the entry is dropped regardless.
    pub async fn remove_archive(&self, location: &Path) -> JbiResult<()> {
        let mut tracking = self.tracking.lock().await;
        self.remove_locked(&mut tracking, location).await
    }

    /// Scan the watched directories once.
    pub async fn poll_once(&self) {
        let config = self.registry.config();
        let mut tracking = self.tracking.lock().await;
        if config.monitor_install_dir {
            self.poll_dir(&mut tracking, &self.install_dir).await;
        }
        if config.monitor_deploy_dir {
            self.poll_dir(&mut tracking, &self.deploy_dir).await;
        }
    }

    /// Start polling on the shared executor. No-op when both monitors are disabled.
    pub fn start(self: &Arc<Self>) {
        let config = self.registry.config();
        if !config.monitor_install_dir && !config.monitor_deploy_dir {
            tracing::debug!("directory monitoring disabled");
            return;
        }
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *monitor = Some(self.registry.executor().spawn_polling(
            "hot-deploy",
            config.monitor_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(service) = weak.upgrade() {
                        service.poll_once().await;
                    }
                }
            },
        ));
        tracing::info!(
            install_dir = %self.install_dir.display(),
            deploy_dir = %self.deploy_dir.display(),
            interval = ?config.monitor_interval(),
            "directory monitoring started"
        );
    }

    /// Cancel the polling task and wait for an in-flight poll to finish.
    pub async fn stop(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.stop(self.registry.config().stop_join_timeout()).await;
            tracing::info!("directory monitoring stopped");
        }
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    async fn poll_dir(&self, tracking: &mut Tracking, dir: &Path) {
        if let Err(e) = fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create watched directory");
            return;
        }
        let files = match list_files(dir) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot list watched directory");
                return;
            }
        };
        tracing::trace!(dir = %dir.display(), files = files.len(), "polling watched directory");

        for file in &files {
            let (Ok(metadata), Ok(modified)) = (fs::metadata(file), archive::last_modified(file)) else {
                continue;
            };
            let known = tracking
                .entries
                .get(file)
                .is_some_and(|e| e.last_modified == modified)
                || tracking.failed.get(file) == Some(&modified);
            if known {
                tracking.sizes.remove(file);
                continue;
            }
            let size = metadata.len();
            if tracking.sizes.insert(file.clone(), size) != Some(size) {
                tracing::debug!(archive = %file.display(), size, "archive size not stable yet; deferred");
                continue;
            }
            if !archive::is_complete(file) {
                tracing::debug!(archive = %file.display(), "archive failed the integrity probe; deferred");
                continue;
            }
            tracking.sizes.remove(file);
            tracing::info!(archive = %file.display(), "processing archive");
            if let Err(e) = self.update_locked(tracking, file).await {
                tracing::error!(archive = %file.display(), error = %e, "failed to process archive");
                tracking.failed.insert(file.clone(), modified);
            }
        }

        let gone: Vec<PathBuf> = tracking
            .entries
            .keys()
            .filter(|l| l.parent() == Some(dir) && !files.contains(*l))
            .cloned()
            .collect();
        for location in gone {
            tracing::info!(archive = %location.display(), "archive removed");
            if let Err(e) = self.remove_locked(tracking, &location).await {
                tracing::error!(archive = %location.display(), error = %e, "failed to remove archive");
            }
        }
        tracking
            .failed
            .retain(|l, _| l.parent() != Some(dir) || files.contains(l));
        tracking
            .sizes
            .retain(|l, _| l.parent() != Some(dir) || files.contains(l));
    }

    async fn update_locked(&self, tracking: &mut Tracking, location: &Path) -> JbiResult<ArchiveEntry> {
        let entry = self.apply(location).await?;
        tracking.failed.remove(location);
        tracking.entries.insert(location.to_path_buf(), entry.clone());
        if !entry.pending {
            self.retry_pending(tracking).await;
        }
        self.persist(tracking)?;
        Ok(entry)
    }

    async fn remove_locked(&self, tracking: &mut Tracking, location: &Path) -> JbiResult<()> {
        tracking.failed.remove(location);
        tracking.sizes.remove(location);
        let Some(entry) = tracking.entries.remove(location) else {
            return Ok(());
        };
        let result = if entry.pending {
            Ok(())
        } else {
            self.discard(&entry).await
        };
        self.persist(tracking)?;
        result
    }

    /// Process pending archives whose prerequisites are now met, libraries
    /// first, then components, then assemblies.
    async fn retry_pending(&self, tracking: &mut Tracking) {
        loop {
            let next = tracking
                .entries
                .values()
                .filter(|e| e.pending && self.missing(e).is_empty())
                .min_by_key(|e| e.kind)
                .map(|e| e.location.clone());
            let Some(location) = next else {
                break;
            };
            tracing::info!(archive = %location.display(), "prerequisites available; processing deferred archive");
            match self.apply(&location).await {
                Ok(entry) => {
                    let still_pending = entry.pending;
                    tracking.entries.insert(location, entry);
                    if still_pending {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(archive = %location.display(), error = %e, "failed to process deferred archive");
                    tracking.entries.remove(&location);
                    if let Ok(modified) = archive::last_modified(&location) {
                        tracking.failed.insert(location, modified);
                    }
                }
            }
        }
    }

    /// Stage the archive and install/deploy it, or return it as pending.
    async fn apply(&self, location: &Path) -> JbiResult<ArchiveEntry> {
        let last_modified = archive::last_modified(location)?;
        let staged = self.installation.stage(location)?;
        let (kind, name, dependencies) = match staged.descriptor() {
            Descriptor::SharedLibrary(d) => (ArchiveKind::SharedLibrary, d.name.clone(), Vec::new()),
            Descriptor::Component(d) => (ArchiveKind::Component, d.name.clone(), d.shared_libraries.clone()),
            Descriptor::ServiceAssembly(d) => (ArchiveKind::ServiceAssembly, d.name.clone(), d.target_components()),
            Descriptor::Services(_) => {
                return Err(JbiError::InvalidDescriptor {
                    path: location.to_path_buf(),
                    reason: "a service unit cannot be deployed on its own".to_owned(),
                });
            }
        };
        let mut entry = ArchiveEntry {
            location: location.to_path_buf(),
            last_modified,
            kind,
            name,
            pending: false,
            dependencies,
        };

        let missing = self.missing(&entry);
        if !missing.is_empty() {
            tracing::warn!(
                kind = kind.as_str(),
                name = %entry.name,
                missing = %missing.join(", "),
                "archive waiting for missing prerequisites"
            );
            entry.pending = true;
            return Ok(entry);
        }

        match kind {
            ArchiveKind::SharedLibrary => {
                if self.registry.libraries().contains(&entry.name) {
                    self.installation
                        .uninstall_shared_library(&entry.name, true)
                        .await?;
                }
                self.installation.install_staged_shared_library(staged).await?;
            }
            ArchiveKind::Component => {
                if self.registry.components().contains(&entry.name) {
                    self.installation.uninstall_component(&entry.name, true).await?;
                }
                self.installation.install_staged_component(staged).await?;
            }
            ArchiveKind::ServiceAssembly => {
                if let Some(existing) = self.registry.get_service_assembly(&entry.name) {
                    if !existing.is_shut_down() {
                        existing.shut_down(false).await?;
                    }
                    self.deployment.undeploy(&entry.name, true).await?;
                }
                self.deployment.deploy_staged(staged).await?;
                if self.registry.config().auto_start
                    && let Err(e) = self.deployment.start(&entry.name).await
                {
                    tracing::warn!(assembly = %entry.name, error = %e, "deployed service assembly failed to start");
                }
            }
        }
        Ok(entry)
    }

    /// Uninstall or undeploy what a removed archive brought in.
    async fn discard(&self, entry: &ArchiveEntry) -> JbiResult<()> {
        match entry.kind {
            ArchiveKind::SharedLibrary => {
                if self.registry.libraries().contains(&entry.name) {
                    self.installation
                        .uninstall_shared_library(&entry.name, true)
                        .await?;
                }
            }
            ArchiveKind::Component => {
                if self.registry.components().contains(&entry.name) {
                    self.installation.uninstall_component(&entry.name, true).await?;
                }
            }
            ArchiveKind::ServiceAssembly => {
                if let Some(assembly) = self.registry.get_service_assembly(&entry.name) {
                    if !assembly.is_shut_down() {
                        assembly.shut_down(false).await?;
                    }
                    self.deployment.undeploy(&entry.name, true).await?;
                }
            }
        }
        Ok(())
    }

    /// Prerequisites of `entry` that are not installed.
    fn missing(&self, entry: &ArchiveEntry) -> Vec<String> {
        match entry.kind {
            ArchiveKind::SharedLibrary => Vec::new(),
            ArchiveKind::Component => self.registry.libraries().missing(&entry.dependencies),
            ArchiveKind::ServiceAssembly => entry
                .dependencies
                .iter()
                .filter(|c| !self.registry.components().contains(c))
                .cloned()
                .collect(),
        }
    }

    fn persist(&self, tracking: &Tracking) -> JbiResult<()> {
        let mut install = BTreeMap::new();
        let mut deploy = BTreeMap::new();
        for (location, entry) in &tracking.entries {
            if entry.pending {
                continue;
            }
            let map = if location.starts_with(&self.install_dir) {
                &mut install
            } else {
                &mut deploy
            };
            map.insert(location.display().to_string(), entry.clone());
        }
        let store = self.registry.store();
        store.save_map(INSTALL_MAP, install)?;
        store.save_map(DEPLOY_MAP, deploy)
    }
}

/// Regular, non-hidden files of `dir`, sorted.
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let hidden = entry.file_name().to_str().is_some_and(|n| n.starts_with('.'));
        if !hidden && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
