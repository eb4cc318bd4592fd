//! Delivery channel contract.
//!
//! Message exchange delivery lives outside the container; a component only
//! needs a channel handle created at init and closed at shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ThrottlingConfig;
use crate::naming::ComponentNameSpace;

pub trait DeliveryChannel: Send + Sync {
    /// Exchanges currently queued for the component.
    fn queue_size(&self) -> usize;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait DeliveryChannelFactory: Send + Sync {
    fn create(
        &self,
        component: &ComponentNameSpace,
        capacity: usize,
        throttling: &ThrottlingConfig,
    ) -> Arc<dyn DeliveryChannel>;
}

/// Channel not attached to any router; used when no factory is configured.
#[derive(Debug, Default)]
pub struct DetachedDeliveryChannel {
    closed: AtomicBool,
}

impl DeliveryChannel for DetachedDeliveryChannel {
    fn queue_size(&self) -> usize {
        0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedChannelFactory;

impl DeliveryChannelFactory for DetachedChannelFactory {
    fn create(
        &self,
        component: &ComponentNameSpace,
        capacity: usize,
        _throttling: &ThrottlingConfig,
    ) -> Arc<dyn DeliveryChannel> {
        tracing::trace!(%component, capacity, "creating detached delivery channel");
        Arc::new(DetachedDeliveryChannel::default())
    }
}
