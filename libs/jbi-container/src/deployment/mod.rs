//! Installation, deployment and directory based hot deployment.
//!
//! - [`InstallationService`]: components and shared libraries.
//! - [`DeploymentService`]: service assemblies and their units.
//! - [`AutoDeploymentService`]: watched directories, dependency-deferred
//!   processing and the persisted processed-file maps.

pub mod archive;
mod auto;
mod installation;
mod layout;
mod service;

pub use archive::{ArchiveEntry, ArchiveKind, StagedArchive};
pub use auto::{AutoDeploymentService, DEPLOY_MAP, INSTALL_MAP};
pub use installation::InstallationService;
pub use service::DeploymentService;
