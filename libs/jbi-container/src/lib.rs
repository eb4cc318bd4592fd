#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! JBI component container core.
//!
//! The crate hosts pluggable components (binding components and service
//! engines), tracks the service assemblies deployed to them and keeps a
//! registry of the service endpoints they expose.
//!
//! ## Layout
//!
//! - [`registry`]: the aggregate [`Registry`] composing the endpoint,
//!   subscription, component, shared-library and service-assembly registries
//!   together with the pending (re)activation queues.
//! - [`component`]: plugin contracts, plugin loading and the per-component
//!   lifecycle state machine.
//! - [`assembly`]: service assembly and service unit state machines.
//! - [`deployment`]: installation, deployment and directory based hot deploy.
//! - [`container`]: [`JbiContainer`], which wires everything together.
//!
//! Transport, message exchange delivery and descriptor XML parsing are
//! external collaborators reached through the traits in [`component`] and
//! [`descriptor`].

pub mod assembly;
pub mod component;
pub mod config;
pub mod container;
pub mod deployment;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod executor;
pub mod library;
pub mod naming;
pub mod persistence;
pub mod registry;
pub mod report;
pub mod state;
pub mod subscription;

pub use config::{ConfigError, ContainerConfig};
pub use container::{JbiContainer, JbiContainerBuilder};
pub use error::{JbiError, JbiResult};
pub use naming::{ComponentNameSpace, QName};
pub use registry::Registry;
pub use state::LifeCycleState;
