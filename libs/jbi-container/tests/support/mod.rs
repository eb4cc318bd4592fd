#![allow(dead_code)]

//! Shared fixtures: a recording engine plugin, archive builders and a
//! container harness rooted in a temporary directory.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use jbi_container::component::{
    Component, ComponentContext, PluginLoader, ServiceUnitManager, StaticPluginLoader,
};
use jbi_container::descriptor::{Descriptor, DescriptorParser, JsonDescriptorParser};
use jbi_container::endpoint::InternalEndpoint;
use jbi_container::events::{ComponentEvent, ContainerListener, ServiceAssemblyEvent};
use jbi_container::{ContainerConfig, JbiContainer, QName};

pub const ENGINE_CLASS: &str = "test.RecordingEngine";
pub const TEST_NS: &str = "urn:test";

/// Ordered log of plugin callbacks, formatted as `<component>:<call>[:<unit>]`.
#[derive(Default)]
pub struct Journal {
    calls: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// Switches flipped by tests to make engines misbehave.
#[derive(Default)]
pub struct Faults {
    pub fail_start: AtomicBool,
    pub hang_unit_start: AtomicBool,
    pub fail_unit_shut_down: AtomicBool,
    /// Units whose `init` is refused.
    pub failing_unit_inits: Mutex<Vec<String>>,
}

impl Faults {
    pub fn fail_unit_init(&self, unit: &str) {
        self.failing_unit_inits.lock().push(unit.to_owned());
    }
}

struct UnitManager {
    component: String,
    journal: Arc<Journal>,
    faults: Arc<Faults>,
    context: Mutex<Option<Arc<ComponentContext>>>,
    endpoints: Mutex<HashMap<String, Vec<Arc<InternalEndpoint>>>>,
}

impl UnitManager {
    fn record(&self, call: &str, unit: &str) {
        self.journal.record(format!("{}:{call}:{unit}", self.component));
    }

    fn context(&self) -> anyhow::Result<Arc<ComponentContext>> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("component not initialized"))
    }
}

#[async_trait]
impl ServiceUnitManager for UnitManager {
    async fn deploy(&self, unit: &str, _root: &Path) -> anyhow::Result<()> {
        self.record("deploy", unit);
        Ok(())
    }

    async fn init(&self, unit: &str, root: &Path) -> anyhow::Result<()> {
        self.record("init", unit);
        if self.faults.failing_unit_inits.lock().iter().any(|u| u == unit) {
            anyhow::bail!("init of {unit} refused");
        }
        let ctx = self.context()?;
        let mut activated = Vec::new();
        if let Descriptor::Services(services) = JsonDescriptorParser.parse(root)? {
            for provides in services.provides {
                let interfaces = provides.interface.into_iter().collect();
                activated.push(ctx.activate_endpoint(provides.service, &provides.endpoint, interfaces)?);
            }
        }
        self.endpoints.lock().insert(unit.to_owned(), activated);
        Ok(())
    }

    async fn start(&self, unit: &str) -> anyhow::Result<()> {
        if self.faults.hang_unit_start.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.record("start", unit);
        Ok(())
    }

    async fn stop(&self, unit: &str) -> anyhow::Result<()> {
        self.record("stop", unit);
        Ok(())
    }

    async fn shut_down(&self, unit: &str) -> anyhow::Result<()> {
        self.record("shut_down", unit);
        if self.faults.fail_unit_shut_down.load(Ordering::SeqCst) {
            anyhow::bail!("shut down of {unit} refused");
        }
        let ctx = self.context()?;
        let endpoints = self.endpoints.lock().remove(unit).unwrap_or_default();
        for endpoint in endpoints {
            ctx.deactivate_endpoint(&endpoint)?;
        }
        Ok(())
    }

    async fn undeploy(&self, unit: &str, _root: &Path) -> anyhow::Result<()> {
        self.record("undeploy", unit);
        Ok(())
    }
}

/// Service engine recording every callback into a shared [`Journal`].
pub struct RecordingEngine {
    name: String,
    journal: Arc<Journal>,
    faults: Arc<Faults>,
    units: Arc<UnitManager>,
}

impl RecordingEngine {
    pub fn new(name: &str, journal: Arc<Journal>, faults: Arc<Faults>) -> Self {
        let units = Arc::new(UnitManager {
            component: name.to_owned(),
            journal: Arc::clone(&journal),
            faults: Arc::clone(&faults),
            context: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
        });
        Self {
            name: name.to_owned(),
            journal,
            faults,
            units,
        }
    }

    fn record(&self, call: &str) {
        self.journal.record(format!("{}:{call}", self.name));
    }
}

#[async_trait]
impl Component for RecordingEngine {
    async fn init(&self, ctx: Arc<ComponentContext>) -> anyhow::Result<()> {
        self.record("init");
        *self.units.context.lock() = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.faults.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("start refused");
        }
        self.record("start");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.record("stop");
        Ok(())
    }

    async fn shut_down(&self) -> anyhow::Result<()> {
        self.record("shut_down");
        *self.units.context.lock() = None;
        Ok(())
    }

    fn service_unit_manager(&self) -> Option<Arc<dyn ServiceUnitManager>> {
        Some(Arc::clone(&self.units) as Arc<dyn ServiceUnitManager>)
    }

    async fn on_install(&self, _install_root: &Path) -> anyhow::Result<()> {
        self.record("install");
        Ok(())
    }

    async fn on_uninstall(&self, _install_root: &Path) -> anyhow::Result<()> {
        self.record("uninstall");
        Ok(())
    }
}

/// Listener collecting component and assembly events as `<name>:<kind>`.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ContainerListener for EventLog {
    fn on_component_event(&self, event: &ComponentEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(format!("{}:{:?}", event.component, event.kind));
        Ok(())
    }

    fn on_service_assembly_event(&self, event: &ServiceAssemblyEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(format!("{}:{:?}", event.assembly, event.kind));
        Ok(())
    }
}

/// A service unit inside a test assembly.
#[derive(Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub component: String,
    pub service: QName,
    pub endpoint: String,
    pub interface: Option<QName>,
    /// `(service, endpoint, link type)` consumed by the unit.
    pub consumes: Vec<(QName, String, String)>,
}

impl Unit {
    /// Unit providing `{urn:test}<name>` / `ep`.
    pub fn new(name: &str, component: &str) -> Self {
        Self {
            name: name.to_owned(),
            component: component.to_owned(),
            service: QName::new(TEST_NS, name),
            endpoint: "ep".to_owned(),
            interface: None,
            consumes: Vec::new(),
        }
    }

    #[must_use]
    pub fn providing(mut self, service: &str, endpoint: &str) -> Self {
        self.service = QName::new(TEST_NS, service);
        self.endpoint = endpoint.to_owned();
        self
    }

    #[must_use]
    pub fn implementing(mut self, interface: &str) -> Self {
        self.interface = Some(QName::new(TEST_NS, interface));
        self
    }

    #[must_use]
    pub fn consuming(mut self, service: &str, endpoint: &str, link_type: &str) -> Self {
        self.consumes
            .push((QName::new(TEST_NS, service), endpoint.to_owned(), link_type.to_owned()));
        self
    }

    fn services_descriptor(&self) -> serde_json::Value {
        let mut provides = json!({"service": self.service.to_string(), "endpoint": self.endpoint});
        if let Some(interface) = &self.interface {
            provides["interface"] = json!(interface.to_string());
        }
        let consumes: Vec<_> = self
            .consumes
            .iter()
            .map(|(service, endpoint, link_type)| {
                json!({"service": service.to_string(), "endpoint": endpoint, "link_type": link_type})
            })
            .collect();
        json!({"services": {"provides": [provides], "consumes": consumes}})
    }
}

/// Connection aliasing the consumer address `{urn:test}<service>` / `endpoint`
/// to a provider endpoint.
pub fn endpoint_link(service: &str, endpoint: &str, to_service: &str, to_endpoint: &str) -> serde_json::Value {
    json!({
        "consumer": {"service": QName::new(TEST_NS, service).to_string(), "endpoint": endpoint},
        "provider": {"service": QName::new(TEST_NS, to_service).to_string(), "endpoint": to_endpoint},
    })
}

/// Connection wiring interface `{urn:test}<interface>` to a provider endpoint.
pub fn interface_link(interface: &str, to_service: &str, to_endpoint: &str) -> serde_json::Value {
    json!({
        "consumer": {"interface": QName::new(TEST_NS, interface).to_string()},
        "provider": {"service": QName::new(TEST_NS, to_service).to_string(), "endpoint": to_endpoint},
    })
}

pub fn zip_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::<()>::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn descriptor_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec_pretty(value).unwrap()
}

/// Temporary container root, archive workshop and plugin fixtures.
pub struct Harness {
    pub root: TempDir,
    pub workshop: TempDir,
    pub loader: Arc<StaticPluginLoader>,
    pub journal: Arc<Journal>,
    pub faults: Arc<Faults>,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Arc::new(Journal::default());
        let faults = Arc::new(Faults::default());
        let loader = Arc::new(StaticPluginLoader::new());
        let (j, f) = (Arc::clone(&journal), Arc::clone(&faults));
        loader.register(ENGINE_CLASS, move |descriptor, _scope| {
            Ok(Arc::new(RecordingEngine::new(&descriptor.name, Arc::clone(&j), Arc::clone(&f)))
                as Arc<dyn Component>)
        });
        Self {
            root: tempfile::tempdir().unwrap(),
            workshop: tempfile::tempdir().unwrap(),
            loader,
            journal,
            faults,
        }
    }

    /// Monitoring disabled, short unit timeout.
    pub fn config(&self) -> ContainerConfig {
        ContainerConfig {
            name: "test".to_owned(),
            monitor_install_dir: false,
            monitor_deploy_dir: false,
            monitor_interval_ms: 50,
            deployment_timeout_ms: 2_000,
            stop_join_timeout_ms: 1_000,
            ..ContainerConfig::with_root(self.root.path())
        }
    }

    /// Monitoring enabled with a fast poll.
    pub fn monitored_config(&self) -> ContainerConfig {
        ContainerConfig {
            monitor_install_dir: true,
            monitor_deploy_dir: true,
            ..self.config()
        }
    }

    pub fn container(&self) -> JbiContainer {
        self.container_with(self.config())
    }

    pub fn container_with(&self, config: ContainerConfig) -> JbiContainer {
        let loader: Arc<dyn PluginLoader> = Arc::clone(&self.loader) as Arc<dyn PluginLoader>;
        JbiContainer::builder(config)
            .with_plugin_loader(loader)
            .build()
            .unwrap()
    }

    /// Container built and started.
    pub async fn started(&self) -> JbiContainer {
        let container = self.container();
        container.start().await.unwrap();
        container
    }

    fn write_archive(&self, file: &str, entries: &[(&str, Vec<u8>)]) -> PathBuf {
        let path = self.workshop.path().join(file);
        std::fs::write(&path, zip_bytes(entries)).unwrap();
        path
    }

    pub fn component_zip(&self, name: &str, libraries: &[&str]) -> PathBuf {
        let descriptor = json!({"component": {
            "name": name,
            "class": ENGINE_CLASS,
            "shared_libraries": libraries,
        }});
        self.write_archive(
            &format!("{name}.zip"),
            &[(JsonDescriptorParser::DESCRIPTOR_PATH, descriptor_bytes(&descriptor))],
        )
    }

    pub fn library_zip(&self, name: &str) -> PathBuf {
        let descriptor = json!({"shared_library": {
            "name": name,
            "version": "1.0",
            "class_path": ["lib"],
        }});
        self.write_archive(
            &format!("{name}.zip"),
            &[
                (JsonDescriptorParser::DESCRIPTOR_PATH, descriptor_bytes(&descriptor)),
                ("lib/README", b"shared".to_vec()),
            ],
        )
    }

    pub fn assembly_zip(&self, name: &str, units: &[Unit]) -> PathBuf {
        self.assembly_zip_with(name, units, &[])
    }

    /// Assembly whose descriptor also carries `connections`.
    pub fn assembly_zip_with(&self, name: &str, units: &[Unit], connections: &[serde_json::Value]) -> PathBuf {
        let descriptor = json!({"service_assembly": {
            "name": name,
            "units": units.iter().map(|u| json!({
                "name": u.name,
                "component": u.component,
                "artifact": format!("{}.zip", u.name),
            })).collect::<Vec<_>>(),
            "connections": connections,
        }});
        let nested: Vec<(String, Vec<u8>)> = units
            .iter()
            .map(|u| {
                (
                    format!("{}.zip", u.name),
                    zip_bytes(&[(
                        JsonDescriptorParser::DESCRIPTOR_PATH,
                        descriptor_bytes(&u.services_descriptor()),
                    )]),
                )
            })
            .collect();
        let mut entries: Vec<(&str, Vec<u8>)> =
            vec![(JsonDescriptorParser::DESCRIPTOR_PATH, descriptor_bytes(&descriptor))];
        entries.extend(nested.iter().map(|(n, b)| (n.as_str(), b.clone())));
        self.write_archive(&format!("{name}.zip"), &entries)
    }
}

/// Copy `archive` into a watched directory.
pub fn drop_into(dir: &Path, archive: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let target = dir.join(archive.file_name().unwrap());
    std::fs::copy(archive, &target).unwrap();
    target
}

/// Wait until `check` holds, failing the test after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
