//! Container event fan-out.
//!
//! Every event goes through one unbounded queue drained by a single task, so
//! listeners observe events in firing order and registry mutations never wait
//! on listener code. Listener errors and panics are logged and swallowed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEventKind {
    Installed,
    Initialized,
    Started,
    Stopped,
    ShutDown,
    Uninstalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentEvent {
    pub component: String,
    pub kind: ComponentEventKind,
}

/// Transitions shared by service assemblies and service units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentEventKind {
    Deployed,
    Started,
    Stopped,
    ShutDown,
    Undeployed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAssemblyEvent {
    pub assembly: String,
    pub kind: DeploymentEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnitEvent {
    pub assembly: String,
    pub component: String,
    pub unit: String,
    pub kind: DeploymentEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEventKind {
    Registered,
    Unregistered,
}

#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub kind: EndpointEventKind,
    pub endpoint: Endpoint,
}

impl EndpointEvent {
    /// `"internal"`, `"external"`, `"linked"` or `"remote"`.
    #[must_use]
    pub fn endpoint_kind(&self) -> &'static str {
        self.endpoint.kind()
    }
}

/// Receives container events. All methods default to no-ops.
pub trait ContainerListener: Send + Sync {
    /// # Errors
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_component_event(&self, _event: &ComponentEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_service_assembly_event(&self, _event: &ServiceAssemblyEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_service_unit_event(&self, _event: &ServiceUnitEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_endpoint_event(&self, _event: &EndpointEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Component(ComponentEvent),
    ServiceAssembly(ServiceAssemblyEvent),
    ServiceUnit(ServiceUnitEvent),
    Endpoint(EndpointEvent),
}

enum Dispatch {
    Event(ContainerEvent),
    Flush(oneshot::Sender<()>),
}

type Listeners = Arc<RwLock<Vec<Arc<dyn ContainerListener>>>>;

/// Ordered, asynchronous event dispatcher.
pub struct EventBus {
    listeners: Listeners,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl EventBus {
    /// Create the bus and spawn its dispatch task on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&listeners), rx));
        Self { listeners, tx }
    }

    pub fn add_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ContainerListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn fire(&self, event: ContainerEvent) {
        if self.tx.send(Dispatch::Event(event)).is_err() {
            tracing::debug!("event dispatcher stopped; dropping event");
        }
    }

    pub fn fire_component(&self, component: &str, kind: ComponentEventKind) {
        self.fire(ContainerEvent::Component(ComponentEvent {
            component: component.to_owned(),
            kind,
        }));
    }

    pub fn fire_assembly(&self, assembly: &str, kind: DeploymentEventKind) {
        self.fire(ContainerEvent::ServiceAssembly(ServiceAssemblyEvent {
            assembly: assembly.to_owned(),
            kind,
        }));
    }

    pub fn fire_unit(&self, assembly: &str, component: &str, unit: &str, kind: DeploymentEventKind) {
        self.fire(ContainerEvent::ServiceUnit(ServiceUnitEvent {
            assembly: assembly.to_owned(),
            component: component.to_owned(),
            unit: unit.to_owned(),
            kind,
        }));
    }

    pub fn fire_endpoint(&self, endpoint: Endpoint, kind: EndpointEventKind) {
        self.fire(ContainerEvent::Endpoint(EndpointEvent { kind, endpoint }));
    }

    /// Wait until every event fired before this call has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Same as [`EventBus::new`].
///
/// # Panics
/// Panics when called outside a tokio runtime.
impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(listeners: Listeners, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Event(event) => {
                let snapshot: Vec<_> = listeners.read().iter().cloned().collect();
                for listener in snapshot {
                    deliver(listener.as_ref(), &event);
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("event dispatcher exiting");
}

fn deliver(listener: &dyn ContainerListener, event: &ContainerEvent) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event {
        ContainerEvent::Component(e) => listener.on_component_event(e),
        ContainerEvent::ServiceAssembly(e) => listener.on_service_assembly_event(e),
        ContainerEvent::ServiceUnit(e) => listener.on_service_unit_event(e),
        ContainerEvent::Endpoint(e) => listener.on_endpoint_event(e),
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, ?event, "listener failed to handle event"),
        Err(_) => tracing::error!(?event, "listener panicked while handling event"),
    }
}
