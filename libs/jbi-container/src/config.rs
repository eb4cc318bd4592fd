//! Container configuration.
//!
//! Values are layered with figment: built-in defaults, then an optional YAML
//! file, then `JBI__`-prefixed environment variables
//! (`JBI__DEPLOYMENT_TIMEOUT_MS=5000`, `JBI__THROTTLING__INTERVAL_MS=10`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "JBI__";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {} does not exist", path.display())]
    FileNotFound { path: PathBuf },
    #[error("invalid container configuration: {source}")]
    Invalid {
        #[source]
        source: Box<figment::Error>,
    },
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to render configuration: {source}")]
    Render {
        #[source]
        source: serde_json::Error,
    },
}

/// Throttling applied to a component's delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    /// Exchanges let through between pauses; `0` disables throttling.
    pub count: u32,
    pub interval_ms: u64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            count: 0,
            interval_ms: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container name; the first half of every `ComponentNameSpace`.
    pub name: String,
    /// Root of all persisted container state.
    pub root_dir: PathBuf,
    /// Watched install directory; `<root>/install` when unset.
    pub install_dir: Option<PathBuf>,
    /// Watched deploy directory; `<root>/deploy` when unset.
    pub deploy_dir: Option<PathBuf>,
    pub monitor_install_dir: bool,
    pub monitor_deploy_dir: bool,
    pub monitor_interval_ms: u64,
    /// Start assemblies once hot deploy has deployed them.
    pub auto_start: bool,
    /// Bound for every service unit deployment operation.
    pub deployment_timeout_ms: u64,
    pub delivery_queue_capacity: usize,
    /// Bounded wait when joining a stopped polling task.
    pub stop_join_timeout_ms: u64,
    pub throttling: ThrottlingConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            root_dir: PathBuf::from("data"),
            install_dir: None,
            deploy_dir: None,
            monitor_install_dir: true,
            monitor_deploy_dir: true,
            monitor_interval_ms: 5_000,
            auto_start: true,
            deployment_timeout_ms: 120_000,
            delivery_queue_capacity: 1_024,
            stop_join_timeout_ms: 5_000,
            throttling: ThrottlingConfig::default(),
        }
    }
}

impl ContainerConfig {
    /// Load configuration: defaults, then `path` (if given), then `JBI__*` env vars.
    ///
    /// # Errors
    /// Returns `ConfigError::FileNotFound` for a missing file and
    /// `ConfigError::Invalid`/`InvalidValue` for malformed or out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Yaml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from an arbitrary figment.
    ///
    /// # Errors
    /// Returns `ConfigError` if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::Invalid {
            source: Box::new(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `root` with every other value defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root.into(),
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns `ConfigError::InvalidValue` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must not be empty".to_owned(),
            });
        }
        if self.deployment_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deployment_timeout_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor_interval_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn install_dir(&self) -> PathBuf {
        self.install_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("install"))
    }

    #[must_use]
    pub fn deploy_dir(&self) -> PathBuf {
        self.deploy_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("deploy"))
    }

    #[must_use]
    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_millis(self.deployment_timeout_ms)
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    #[must_use]
    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }

    /// Effective configuration as pretty JSON.
    ///
    /// # Errors
    /// Returns `ConfigError::Render` if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|source| ConfigError::Render { source })
    }
}
