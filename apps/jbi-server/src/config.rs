//! Server configuration: the container settings plus host-only logging options.
//!
//! Layering: defaults -> YAML file (if provided) -> `JBI__*` environment
//! variables -> CLI overrides.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use jbi_container::ContainerConfig;
use jbi_container::config::ENV_PREFIX;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset and no `-v` flag is given.
    pub level: String,
    /// Emit one JSON object per line instead of human readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// # Errors
    /// Fails for a missing file, malformed values or an invalid container section.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.container.validate()?;
        Ok(config)
    }

    /// `-v` info, `-vv` debug, `-vvv` trace.
    pub fn apply_verbosity(&mut self, verbose: u8) {
        let level = match verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        level.clone_into(&mut self.logging.level);
    }

    /// # Errors
    /// Fails if serialization fails.
    pub fn to_pretty_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn container_keys_sit_at_the_top_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: node-a\nroot_dir: /srv/jbi\nlogging:\n  json: true\n  level: warn"
        )
        .unwrap();

        temp_env::with_vars_unset(["JBI__NAME", "JBI__LOGGING__LEVEL"], || {
            let cfg = AppConfig::load(Some(file.path())).unwrap();
            assert_eq!(cfg.container.name, "node-a");
            assert_eq!(cfg.container.deploy_dir(), Path::new("/srv/jbi/deploy"));
            assert!(cfg.logging.json);
            assert_eq!(cfg.logging.level, "warn");
        });
    }

    #[test]
    fn environment_overrides_logging_and_container() {
        temp_env::with_vars(
            [
                ("JBI__LOGGING__LEVEL", Some("debug")),
                ("JBI__AUTO_START", Some("false")),
            ],
            || {
                let cfg = AppConfig::load(None).unwrap();
                assert_eq!(cfg.logging.level, "debug");
                assert!(!cfg.container.auto_start);
            },
        );
    }

    #[test]
    fn verbosity_flag_wins_over_configured_level() {
        let mut cfg = AppConfig::default();
        cfg.apply_verbosity(0);
        assert_eq!(cfg.logging.level, "info");
        cfg.apply_verbosity(2);
        assert_eq!(cfg.logging.level, "debug");
        cfg.apply_verbosity(7);
        assert_eq!(cfg.logging.level, "trace");
    }

    #[test]
    fn invalid_container_values_are_rejected() {
        temp_env::with_var("JBI__DEPLOYMENT_TIMEOUT_MS", Some("0"), || {
            assert!(AppConfig::load(None).is_err());
        });
    }
}
