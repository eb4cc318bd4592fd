//! Container error taxonomy.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;
use crate::naming::QName;
use crate::state::LifeCycleState;

/// Errors raised by the container core.
///
/// Precondition errors carry the entity and task names so a structured
/// [`TaskReport`](crate::report::TaskReport) can be built from them.
#[derive(Debug, thiserror::Error)]
pub enum JbiError {
    #[error("{kind} endpoint for service {service} and endpoint {endpoint} is already registered")]
    DuplicateEndpoint {
        kind: &'static str,
        service: QName,
        endpoint: String,
    },

    #[error("an interface connection for {interface} is already registered")]
    DuplicateInterfaceConnection { interface: QName },

    #[error("component '{0}' is not installed")]
    ComponentNotFound(String),

    #[error("component '{0}' is already installed")]
    ComponentAlreadyInstalled(String),

    #[error("component '{component}' still has deployed service units: {}", units.join(", "))]
    ComponentHasServiceUnits {
        component: String,
        units: Vec<String>,
    },

    #[error("shared library '{0}' is not installed")]
    SharedLibraryNotFound(String),

    #[error("shared library '{0}' is already installed")]
    SharedLibraryAlreadyInstalled(String),

    #[error("shared library '{library}' is in use by component '{component}'")]
    SharedLibraryInUse { library: String, component: String },

    #[error("service assembly '{0}' is not deployed")]
    AssemblyNotFound(String),

    #[error("service assembly '{0}' is already deployed")]
    AssemblyAlreadyDeployed(String),

    #[error("cannot {task} {entity} '{name}' while it is {state}")]
    InvalidState {
        entity: &'static str,
        name: String,
        task: &'static str,
        state: LifeCycleState,
    },

    #[error("{entity} '{name}' is missing dependencies: {}", missing.join(", "))]
    MissingDependencies {
        entity: &'static str,
        name: String,
        missing: Vec<String>,
    },

    #[error("no deployment descriptor found in {}", path.display())]
    DescriptorNotFound { path: PathBuf },

    #[error("invalid deployment descriptor {}: {reason}", path.display())]
    InvalidDescriptor { path: PathBuf, reason: String },

    #[error("component '{component}' failed to {task}: {source}")]
    Plugin {
        component: String,
        task: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("no plugin factory registered for component class '{class}'")]
    PluginNotFound { class: String },

    #[error("{task} of service unit '{unit}' failed on component '{component}': {message}")]
    Deployment {
        task: &'static str,
        component: String,
        unit: String,
        message: String,
    },

    #[error("{task} of service unit '{unit}' on component '{component}' timed out after {timeout:?}")]
    Timeout {
        task: &'static str,
        component: String,
        unit: String,
        timeout: Duration,
    },

    #[error("{task} of service assembly '{assembly}' failed for {} service unit(s)", failures.len())]
    Composite {
        task: &'static str,
        assembly: String,
        failures: Vec<JbiError>,
    },

    #[error("invalid endpoint reference: {0}")]
    InvalidReference(String),

    #[error("invalid archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot {task} container '{container}' once it is {phase}")]
    InvalidContainerPhase {
        container: String,
        task: &'static str,
        phase: &'static str,
    },

    #[error("the registry has been dropped")]
    RegistryUnavailable,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type JbiResult<T> = Result<T, JbiError>;

impl JbiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn plugin(component: &str, task: &'static str, source: anyhow::Error) -> Self {
        Self::Plugin {
            component: component.to_owned(),
            task,
            source,
        }
    }

    /// `true` for a deployment timeout, or a composite failure made only of timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Composite { failures, .. } => {
                !failures.is_empty() && failures.iter().all(Self::is_timeout)
            }
            _ => false,
        }
    }

    /// Individual failures of a composite error; a single-element slice otherwise.
    #[must_use]
    pub fn failures(&self) -> &[JbiError] {
        match self {
            Self::Composite { failures, .. } => failures,
            other => std::slice::from_ref(other),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn timeout(unit: &str) -> JbiError {
        JbiError::Timeout {
            task: "start",
            component: "c1".to_owned(),
            unit: unit.to_owned(),
            timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn composite_of_timeouts_is_timeout() {
        let err = JbiError::Composite {
            task: "start",
            assembly: "sa".to_owned(),
            failures: vec![timeout("a"), timeout("b")],
        };
        assert!(err.is_timeout());
        assert_eq!(err.failures().len(), 2);
        assert_eq!(
            err.to_string(),
            "start of service assembly 'sa' failed for 2 service unit(s)"
        );
    }

    #[test]
    fn single_error_failures_is_itself() {
        let err = JbiError::ComponentNotFound("c9".to_owned());
        assert_eq!(err.failures().len(), 1);
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "component 'c9' is not installed");
    }
}
