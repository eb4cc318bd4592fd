//! Service assemblies and the service units they deploy to components.

mod lifecycle;
mod registry;
mod unit;

pub use lifecycle::ServiceAssemblyLifeCycle;
pub use registry::ServiceAssemblyRegistry;
pub use unit::{ServiceUnitLifeCycle, UnitTask};
