use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::ComponentRecord;
use crate::error::{JbiError, JbiResult};

/// Registered components in registration order.
///
/// Start walks the order forward, stop and shutdown walk it backwards. The
/// first start replays each component's persisted running state instead of
/// plainly starting it.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<Vec<Arc<ComponentRecord>>>,
    lifecycle: Mutex<Phase>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Phase {
    running_state_initialized: bool,
    started: bool,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `JbiError::ComponentAlreadyInstalled` for a duplicate name.
    pub fn register(&self, record: Arc<ComponentRecord>) -> JbiResult<()> {
        let mut components = self.components.write();
        if components.iter().any(|c| c.name() == record.name()) {
            return Err(JbiError::ComponentAlreadyInstalled(record.name().to_owned()));
        }
        tracing::debug!(component = %record.name(), "component registered");
        components.push(record);
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<ComponentRecord>> {
        let mut components = self.components.write();
        let pos = components.iter().position(|c| c.name() == name)?;
        tracing::debug!(component = %name, "component deregistered");
        Some(components.remove(pos))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ComponentRecord>> {
        self.components
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.components.read().iter().any(|c| c.name() == name)
    }

    /// Snapshot in registration order.
    #[must_use]
    pub fn components(&self) -> Vec<Arc<ComponentRecord>> {
        self.components.read().clone()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.components
            .read()
            .iter()
            .map(|c| c.name().to_owned())
            .collect()
    }

    /// Whether `start_all` ran more recently than `stop_all`/`shut_down_all`.
    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.started
    }

    /// Start every component in registration order.
    ///
    /// The first call applies each component's persisted running state.
    /// Every component is attempted; the first failure is returned.
    ///
    /// # Errors
    /// Returns the first component failure.
    pub async fn start_all(&self) -> JbiResult<()> {
        let mut phase = self.lifecycle.lock().await;
        let first = !phase.running_state_initialized;
        phase.running_state_initialized = true;

        let mut first_error = None;
        for component in self.components() {
            let result = if first {
                component.set_initial_running_state().await
            } else {
                component.do_start().await
            };
            if let Err(e) = result {
                tracing::error!(component = %component.name(), error = %e, "failed to start component");
                first_error.get_or_insert(e);
            }
        }
        phase.started = true;
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every component in reverse registration order.
    ///
    /// # Errors
    /// Returns the first component failure.
    pub async fn stop_all(&self) -> JbiResult<()> {
        let mut phase = self.lifecycle.lock().await;
        let mut first_error = None;
        for component in self.components().iter().rev() {
            if let Err(e) = component.do_stop().await {
                tracing::error!(component = %component.name(), error = %e, "failed to stop component");
                first_error.get_or_insert(e);
            }
        }
        phase.started = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Stop, then shut down every component, both in reverse registration order.
    ///
    /// # Errors
    /// Returns the first component failure.
    pub async fn shut_down_all(&self) -> JbiResult<()> {
        let stopped = self.stop_all().await;
        let _phase = self.lifecycle.lock().await;
        let mut first_error = stopped.err();
        for component in self.components().iter().rev() {
            if let Err(e) = component.do_shut_down().await {
                tracing::error!(component = %component.name(), error = %e, "failed to shut down component");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
