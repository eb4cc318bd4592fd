//! Qualified names and component namespaces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Qualified name (`{namespace}local`), used for services, interfaces and operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    namespace: String,
    local: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    /// Name without a namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self::new(String::new(), local)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local
    }
}

/// Error returned when a string is not a valid `{namespace}local` name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid qualified name '{0}'")]
pub struct QNameParseError(pub String);

impl FromStr for QName {
    type Err = QNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QNameParseError(s.to_owned()));
        }
        let Some(rest) = s.strip_prefix('{') else {
            return Ok(Self::local(s));
        };
        let (ns, local) = rest
            .split_once('}')
            .ok_or_else(|| QNameParseError(s.to_owned()))?;
        if local.is_empty() {
            return Err(QNameParseError(s.to_owned()));
        }
        Ok(Self::new(ns, local))
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

impl Serialize for QName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Unique key of a component instance: the hosting container plus the component name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentNameSpace {
    container: String,
    name: String,
}

impl ComponentNameSpace {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ComponentNameSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}
