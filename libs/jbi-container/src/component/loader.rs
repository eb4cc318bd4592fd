//! Plugin loading.
//!
//! Plugins are resolved from a compiled-in registry keyed by the component
//! class named in the descriptor. Factories come from explicit
//! [`StaticPluginLoader::register`] calls or from `inventory` submissions of
//! [`PluginRegistration`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Component, PluginScope};
use crate::descriptor::ComponentDescriptor;
use crate::error::{JbiError, JbiResult};

pub type PluginFactory =
    Arc<dyn Fn(&ComponentDescriptor, &Arc<PluginScope>) -> anyhow::Result<Arc<dyn Component>> + Send + Sync>;

/// Creates the plugin instance for an installed component.
pub trait PluginLoader: Send + Sync {
    /// # Errors
    /// Returns `JbiError::PluginNotFound` for an unknown class and
    /// `JbiError::Plugin` if the factory fails.
    fn load(&self, descriptor: &ComponentDescriptor, scope: &Arc<PluginScope>) -> JbiResult<Arc<dyn Component>>;
}

/// Link-time plugin registration.
///
/// ```ignore
/// inventory::submit! {
///     jbi_container::component::PluginRegistration {
///         class: "acme.FileBinding",
///         factory: |_descriptor, _scope| Ok(std::sync::Arc::new(FileBinding::default())),
///     }
/// }
/// ```
pub struct PluginRegistration {
    pub class: &'static str,
    pub factory: fn(&ComponentDescriptor, &Arc<PluginScope>) -> anyhow::Result<Arc<dyn Component>>,
}

inventory::collect!(PluginRegistration);

#[derive(Default)]
pub struct StaticPluginLoader {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl StaticPluginLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader pre-populated with every `inventory`-submitted registration.
    #[must_use]
    pub fn from_inventory() -> Self {
        let loader = Self::new();
        for registration in inventory::iter::<PluginRegistration> {
            let factory = registration.factory;
            loader.register(registration.class, move |d, s| factory(d, s));
        }
        loader
    }

    /// Register (or replace) the factory for `class`.
    pub fn register<F>(&self, class: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentDescriptor, &Arc<PluginScope>) -> anyhow::Result<Arc<dyn Component>>
            + Send
            + Sync
            + 'static,
    {
        let class = class.into();
        tracing::debug!(%class, "plugin factory registered");
        self.factories.write().insert(class, Arc::new(factory));
    }

    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<_> = self.factories.read().keys().cloned().collect();
        classes.sort();
        classes
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self, descriptor: &ComponentDescriptor, scope: &Arc<PluginScope>) -> JbiResult<Arc<dyn Component>> {
        let factory = self
            .factories
            .read()
            .get(&descriptor.class)
            .cloned()
            .ok_or_else(|| JbiError::PluginNotFound {
                class: descriptor.class.clone(),
            })?;
        factory(descriptor, scope).map_err(|e| JbiError::plugin(&descriptor.name, "load", e))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::component::{ComponentContext, Delegation};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Component for Noop {
        async fn init(&self, _ctx: Arc<ComponentContext>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shut_down(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn scope() -> Arc<PluginScope> {
        Arc::new(PluginScope::new("c1", Vec::new(), Vec::new(), Delegation::ParentFirst))
    }

    #[test]
    fn loads_registered_class() {
        let loader = StaticPluginLoader::new();
        loader.register("acme.Noop", |_, _| Ok(Arc::new(Noop) as Arc<dyn Component>));
        assert_eq!(loader.classes(), ["acme.Noop"]);

        let descriptor = ComponentDescriptor::new("c1", "acme.Noop");
        assert!(loader.load(&descriptor, &scope()).is_ok());
    }

    #[test]
    fn unknown_class_and_factory_errors_are_reported() {
        let loader = StaticPluginLoader::new();
        loader.register("acme.Broken", |_, _| Err(anyhow::anyhow!("no licence")));

        let err = loader
            .load(&ComponentDescriptor::new("c1", "acme.Missing"), &scope())
            .err()
            .unwrap();
        assert!(matches!(err, JbiError::PluginNotFound { .. }));

        let err = loader
            .load(&ComponentDescriptor::new("c1", "acme.Broken"), &scope())
            .err()
            .unwrap();
        assert!(matches!(err, JbiError::Plugin { task: "load", .. }));
    }
}
