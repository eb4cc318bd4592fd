//! Component plugins and their lifecycle.
//!
//! - [`Component`] / [`ServiceUnitManager`]: the plugin contract.
//! - [`PluginLoader`]: turns a component descriptor into a plugin instance.
//! - [`PluginScope`]: per-component resource isolation chained to shared libraries.
//! - [`ComponentRecord`]: the lifecycle state machine around one plugin.
//! - [`ComponentRegistry`]: ordered start/stop/shutdown of all components.

mod channel;
mod context;
mod loader;
mod plugin;
mod record;
mod registry;
mod scope;

pub use channel::{
    DeliveryChannel, DeliveryChannelFactory, DetachedChannelFactory, DetachedDeliveryChannel,
};
pub use context::ComponentContext;
pub use loader::{PluginFactory, PluginLoader, PluginRegistration, StaticPluginLoader};
pub use plugin::{Component, ServiceUnitManager};
pub use record::{ComponentParts, ComponentRecord, ComponentStats};
pub use registry::ComponentRegistry;
pub use scope::{Delegation, PluginScope};
