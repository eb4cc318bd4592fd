//! Lifecycle states shared by components, service assemblies and service units.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Running state of a lifecycle-managed entity.
///
/// Components start out as `Unknown` and are moved to `Shutdown` once
/// installation completes. Assemblies and units never leave the
/// `Shutdown`/`Stopped`/`Started` triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeCycleState {
    #[default]
    Unknown,
    Shutdown,
    Stopped,
    Started,
}

impl LifeCycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Shutdown => "SHUTDOWN",
            Self::Stopped => "STOPPED",
            Self::Started => "STARTED",
        }
    }

    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(self, Self::Started)
    }

    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }

    #[must_use]
    pub const fn is_shut_down(self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl fmt::Display for LifeCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_upper_case() {
        let json = serde_json::to_string(&LifeCycleState::Started).unwrap();
        assert_eq!(json, r#""STARTED""#);
        let back: LifeCycleState = serde_json::from_str(r#""SHUTDOWN""#).unwrap();
        assert_eq!(back, LifeCycleState::Shutdown);
    }

    #[test]
    fn default_is_unknown() {
        assert_eq!(LifeCycleState::default(), LifeCycleState::Unknown);
        assert_eq!(LifeCycleState::Stopped.to_string(), "STOPPED");
    }
}
