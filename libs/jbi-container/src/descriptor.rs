//! Deployment descriptors.
//!
//! The container works on the typed model below. Turning an unpacked archive
//! into that model is the job of a [`DescriptorParser`]; the bundled
//! [`JsonDescriptorParser`] reads `META-INF/jbi.json`.

use std::path::{Component as PathComponent, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::component::Delegation;
use crate::endpoint::LinkType;
use crate::error::{JbiError, JbiResult};
use crate::naming::QName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    BindingComponent,
    #[default]
    ServiceEngine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ComponentKind,
    /// Plugin class name resolved by the plugin loader.
    pub class: String,
    /// Resource roots relative to the install directory.
    #[serde(default)]
    pub class_path: Vec<String>,
    #[serde(default)]
    pub shared_libraries: Vec<String>,
    #[serde(default)]
    pub delegation: Delegation,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: ComponentKind::default(),
            class: class.into(),
            class_path: Vec::new(),
            shared_libraries: Vec::new(),
            delegation: Delegation::default(),
        }
    }

    #[must_use]
    pub fn with_shared_library(mut self, library: impl Into<String>) -> Self {
        self.shared_libraries.push(library.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLibraryDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub class_path: Vec<String>,
    #[serde(default)]
    pub delegation: Delegation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnitDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Target component name.
    pub component: String,
    /// Nested archive (zip file or directory) inside the assembly.
    pub artifact: String,
}

/// Consumer side of a connection: a service endpoint or an interface.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsumerRef {
    #[serde(default)]
    pub service: Option<QName>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub interface: Option<QName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub service: QName,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub consumer: ConsumerRef,
    pub provider: ProviderRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssemblyDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub units: Vec<ServiceUnitDescriptor>,
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,
}

impl ServiceAssemblyDescriptor {
    /// Distinct target component names, in unit order.
    #[must_use]
    pub fn target_components(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for unit in &self.units {
            if !out.contains(&unit.component) {
                out.push(unit.component.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidesDescriptor {
    #[serde(default)]
    pub interface: Option<QName>,
    pub service: QName,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumesDescriptor {
    #[serde(default)]
    pub interface: Option<QName>,
    #[serde(default)]
    pub service: Option<QName>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub link_type: LinkType,
}

/// Services a service unit provides and consumes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServicesDescriptor {
    #[serde(default)]
    pub binding_component: bool,
    #[serde(default)]
    pub provides: Vec<ProvidesDescriptor>,
    #[serde(default)]
    pub consumes: Vec<ConsumesDescriptor>,
}

impl ServicesDescriptor {
    /// Link type declared for a consumer address.
    #[must_use]
    pub fn link_type_for(&self, service: &QName, endpoint: &str) -> Option<LinkType> {
        self.consumes
            .iter()
            .find(|c| c.service.as_ref() == Some(service) && c.endpoint.as_deref() == Some(endpoint))
            .map(|c| c.link_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    Component(ComponentDescriptor),
    SharedLibrary(SharedLibraryDescriptor),
    ServiceAssembly(ServiceAssemblyDescriptor),
    Services(ServicesDescriptor),
}

impl Descriptor {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Component(_) => "component",
            Self::SharedLibrary(_) => "shared library",
            Self::ServiceAssembly(_) => "service assembly",
            Self::Services(_) => "services",
        }
    }

    /// Reject names and archive paths that do not stay inside the container
    /// layout. Entity names become directory names; artifact and class-path
    /// entries are resolved against the unpacked archive.
    ///
    /// # Errors
    /// Returns `JbiError::InvalidDescriptor` naming the offending field.
    pub fn validate(&self, path: &Path) -> JbiResult<()> {
        let invalid = |field: &str, reason: String| JbiError::InvalidDescriptor {
            path: path.to_path_buf(),
            reason: format!("{field}: {reason}"),
        };
        match self {
            Self::Component(c) => {
                check_name(&c.name).map_err(|r| invalid("component name", r))?;
                for library in &c.shared_libraries {
                    check_name(library).map_err(|r| invalid("shared library", r))?;
                }
                for entry in &c.class_path {
                    check_relative_path(entry).map_err(|r| invalid("class path", r))?;
                }
            }
            Self::SharedLibrary(l) => {
                check_name(&l.name).map_err(|r| invalid("shared library name", r))?;
                for entry in &l.class_path {
                    check_relative_path(entry).map_err(|r| invalid("class path", r))?;
                }
            }
            Self::ServiceAssembly(sa) => {
                check_name(&sa.name).map_err(|r| invalid("service assembly name", r))?;
                for unit in &sa.units {
                    check_name(&unit.name).map_err(|r| invalid("service unit name", r))?;
                    check_name(&unit.component).map_err(|r| invalid("target component", r))?;
                    check_relative_path(&unit.artifact).map_err(|r| invalid("artifact", r))?;
                }
            }
            Self::Services(_) => {}
        }
        Ok(())
    }
}

/// A name usable as a single directory name on every platform.
///
/// # Errors
/// Returns the reason the name is rejected.
pub fn check_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_owned());
    }
    if name == "." || name == ".." {
        return Err(format!("'{name}' is not a valid name"));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | ':' | '\0')) {
        return Err(format!("'{name}' contains '{}'", c.escape_default()));
    }
    Ok(())
}

/// A non-empty relative path made of plain segments only.
fn check_relative_path(entry: &str) -> Result<(), String> {
    let plain = !entry.is_empty()
        && !entry.contains('\\')
        && Path::new(entry)
            .components()
            .all(|c| matches!(c, PathComponent::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(format!("'{entry}' is not a plain relative path"))
    }
}

/// Reads the deployment descriptor of an unpacked archive.
pub trait DescriptorParser: Send + Sync {
    /// # Errors
    /// Returns `JbiError::DescriptorNotFound` if the directory carries no
    /// descriptor and `JbiError::InvalidDescriptor` if it cannot be parsed.
    fn parse(&self, dir: &Path) -> JbiResult<Descriptor>;
}

/// Parse the descriptor of `dir` and [`validate`](Descriptor::validate) it.
///
/// # Errors
/// Parser errors, or `JbiError::InvalidDescriptor` for unusable names.
pub fn read_descriptor(parser: &dyn DescriptorParser, dir: &Path) -> JbiResult<Descriptor> {
    let descriptor = parser.parse(dir)?;
    descriptor.validate(dir)?;
    Ok(descriptor)
}

/// Parser for `META-INF/jbi.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDescriptorParser;

impl JsonDescriptorParser {
    pub const DESCRIPTOR_PATH: &'static str = "META-INF/jbi.json";

    #[must_use]
    pub fn descriptor_path(dir: &Path) -> PathBuf {
        dir.join(Self::DESCRIPTOR_PATH)
    }
}

impl DescriptorParser for JsonDescriptorParser {
    fn parse(&self, dir: &Path) -> JbiResult<Descriptor> {
        let path = Self::descriptor_path(dir);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JbiError::DescriptorNotFound {
                    path: dir.to_path_buf(),
                });
            }
            Err(e) => return Err(JbiError::io(&path, e)),
        };
        serde_json::from_slice(&raw).map_err(|e| JbiError::InvalidDescriptor {
            path,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn write_descriptor(dir: &Path, json: &str) {
        let path = JsonDescriptorParser::descriptor_path(dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn parses_service_assembly() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            r#"{"service_assembly": {
                "name": "sa",
                "units": [
                    {"name": "su1", "component": "c1", "artifact": "su1.zip"},
                    {"name": "su2", "component": "c2", "artifact": "su2.zip"},
                    {"name": "su3", "component": "c1", "artifact": "su3.zip"}
                ],
                "connections": [{
                    "consumer": {"interface": "{urn:x}Iface"},
                    "provider": {"service": "{urn:x}svc", "endpoint": "ep"}
                }]
            }}"#,
        );

        let Descriptor::ServiceAssembly(sa) = JsonDescriptorParser.parse(dir.path()).unwrap() else {
            panic!("expected a service assembly");
        };
        assert_eq!(sa.target_components(), ["c1", "c2"]);
        assert_eq!(
            sa.connections[0].consumer.interface,
            Some(QName::new("urn:x", "Iface"))
        );
    }

    #[test]
    fn parses_component_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            r#"{"component": {"name": "c1", "class": "acme.Engine", "shared_libraries": ["lib1"]}}"#,
        );
        let Descriptor::Component(c) = JsonDescriptorParser.parse(dir.path()).unwrap() else {
            panic!("expected a component");
        };
        assert_eq!(c.kind, ComponentKind::ServiceEngine);
        assert_eq!(c.delegation, Delegation::ParentFirst);
        assert_eq!(c.shared_libraries, ["lib1"]);
    }

    #[test]
    fn missing_and_invalid_descriptors_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JsonDescriptorParser.parse(dir.path()),
            Err(JbiError::DescriptorNotFound { .. })
        ));
        write_descriptor(dir.path(), "{\"unknown\": {}}");
        assert!(matches!(
            JsonDescriptorParser.parse(dir.path()),
            Err(JbiError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn names_that_leave_the_layout_are_rejected() {
        for bad in ["", ".", "..", "a/b", "a\\b", "c:1"] {
            assert!(check_name(bad).is_err(), "{bad:?} accepted");
        }
        assert!(check_name("component-1.v2").is_ok());

        let dir = Path::new("c1");
        let mut component = ComponentDescriptor::new("c1", "acme.Engine").with_shared_library("lib1");
        component.class_path.push("lib/ext".to_owned());
        assert!(Descriptor::Component(component.clone()).validate(dir).is_ok());

        component.class_path.push("../outside".to_owned());
        let err = Descriptor::Component(component).validate(dir).unwrap_err();
        assert!(matches!(err, JbiError::InvalidDescriptor { ref reason, .. } if reason.starts_with("class path")));

        let library = ComponentDescriptor::new("c1", "acme.Engine").with_shared_library("..");
        assert!(Descriptor::Component(library).validate(dir).is_err());
    }

    #[test]
    fn assembly_artifacts_must_stay_inside_the_archive() {
        let assembly = |unit: &str, artifact: &str| {
            Descriptor::ServiceAssembly(ServiceAssemblyDescriptor {
                name: "sa".to_owned(),
                description: String::new(),
                units: vec![ServiceUnitDescriptor {
                    name: unit.to_owned(),
                    description: String::new(),
                    component: "c1".to_owned(),
                    artifact: artifact.to_owned(),
                }],
                connections: Vec::new(),
            })
        };
        let dir = Path::new("sa");
        assert!(assembly("su", "units/su.zip").validate(dir).is_ok());
        for bad in ["../su.zip", "/etc/passwd", "units/../../su.zip", "./su.zip", ""] {
            assert!(assembly("su", bad).validate(dir).is_err(), "{bad:?} accepted");
        }
        assert!(assembly("..", "su.zip").validate(dir).is_err());
    }

    #[test]
    fn read_descriptor_validates_what_the_parser_returns() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            r#"{"component": {"name": "..", "class": "acme.Engine"}}"#,
        );
        assert!(JsonDescriptorParser.parse(dir.path()).is_ok());
        let err = read_descriptor(&JsonDescriptorParser, dir.path()).unwrap_err();
        assert!(matches!(err, JbiError::InvalidDescriptor { ref reason, .. } if reason.starts_with("component name")));
    }

    #[test]
    fn link_type_lookup() {
        let services = ServicesDescriptor {
            consumes: vec![ConsumesDescriptor {
                interface: None,
                service: Some(QName::local("s")),
                endpoint: Some("ep".to_owned()),
                link_type: LinkType::Soft,
            }],
            ..ServicesDescriptor::default()
        };
        assert_eq!(
            services.link_type_for(&QName::local("s"), "ep"),
            Some(LinkType::Soft)
        );
        assert_eq!(services.link_type_for(&QName::local("s"), "other"), None);
    }
}
