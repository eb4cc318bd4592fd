//! Publish/subscribe matching of message exchanges to subscriber endpoints.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::endpoint::InternalEndpoint;
use crate::naming::{ComponentNameSpace, QName};

/// The part of a message exchange subscriptions look at.
pub trait ExchangeView: Send + Sync {
    fn service(&self) -> Option<&QName>;
    fn interface(&self) -> Option<&QName>;
    fn operation(&self) -> Option<&QName>;
    fn endpoint(&self) -> Option<&str>;

    fn property(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }
}

/// Content predicate applied after the address criteria matched.
pub trait SubscriptionFilter: Send + Sync {
    fn matches(&self, exchange: &dyn ExchangeView) -> bool;
}

/// Matching criteria plus the owning component. Unset criteria match anything.
#[derive(Clone)]
pub struct SubscriptionSpec {
    pub owner: ComponentNameSpace,
    pub service: Option<QName>,
    pub interface: Option<QName>,
    pub operation: Option<QName>,
    pub endpoint: Option<String>,
    pub filter: Option<Arc<dyn SubscriptionFilter>>,
}

impl SubscriptionSpec {
    pub fn new(owner: ComponentNameSpace) -> Self {
        Self {
            owner,
            service: None,
            interface: None,
            operation: None,
            endpoint: None,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: QName) -> Self {
        self.service = Some(service);
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: QName) -> Self {
        self.interface = Some(interface);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: QName) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn SubscriptionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn matches(&self, exchange: &dyn ExchangeView) -> bool {
        fn same<T: PartialEq + ?Sized>(wanted: Option<&T>, actual: Option<&T>) -> bool {
            wanted.is_none_or(|w| actual == Some(w))
        }
        same(self.service.as_ref(), exchange.service())
            && same(self.interface.as_ref(), exchange.interface())
            && same(self.operation.as_ref(), exchange.operation())
            && same(self.endpoint.as_deref(), exchange.endpoint())
            && self.filter.as_ref().is_none_or(|f| f.matches(exchange))
    }
}

impl fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("owner", &self.owner)
            .field("service", &self.service)
            .field("interface", &self.interface)
            .field("operation", &self.operation)
            .field("endpoint", &self.endpoint)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub spec: SubscriptionSpec,
    pub endpoint: Arc<InternalEndpoint>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `endpoint`; the same component may hold any number of subscriptions.
    pub fn register(&self, spec: SubscriptionSpec, endpoint: Arc<InternalEndpoint>) -> Uuid {
        let id = Uuid::now_v7();
        tracing::debug!(%id, component = %spec.owner, endpoint = %endpoint.key(), "subscription registered");
        self.subscriptions.write().push(Subscription { id, spec, endpoint });
        id
    }

    pub fn deregister(&self, id: Uuid) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Drop every subscription owned by `component`; returns how many were removed.
    pub fn deregister_for_component(&self, component: &ComponentNameSpace) -> usize {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| &s.spec.owner != component);
        before - subs.len()
    }

    #[must_use]
    pub fn subscriptions_for_component(&self, component: &ComponentNameSpace) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| &s.spec.owner == component)
            .cloned()
            .collect()
    }

    /// Endpoints of every subscription matching `exchange`, in subscription order.
    #[must_use]
    pub fn matching_endpoints(&self, exchange: &dyn ExchangeView) -> Vec<Arc<InternalEndpoint>> {
        let mut out: Vec<Arc<InternalEndpoint>> = Vec::new();
        for sub in self.subscriptions.read().iter() {
            if sub.spec.matches(exchange) && !out.iter().any(|e| Arc::ptr_eq(e, &sub.endpoint)) {
                out.push(Arc::clone(&sub.endpoint));
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKey;

    struct Exchange {
        service: Option<QName>,
        operation: Option<QName>,
        priority: i64,
    }

    impl ExchangeView for Exchange {
        fn service(&self) -> Option<&QName> {
            self.service.as_ref()
        }
        fn interface(&self) -> Option<&QName> {
            None
        }
        fn operation(&self) -> Option<&QName> {
            self.operation.as_ref()
        }
        fn endpoint(&self) -> Option<&str> {
            None
        }
        fn property(&self, name: &str) -> Option<serde_json::Value> {
            (name == "priority").then(|| self.priority.into())
        }
    }

    struct HighPriority;

    impl SubscriptionFilter for HighPriority {
        fn matches(&self, exchange: &dyn ExchangeView) -> bool {
            exchange
                .property("priority")
                .and_then(|v| v.as_i64())
                .is_some_and(|p| p > 5)
        }
    }

    fn endpoint(name: &str) -> Arc<InternalEndpoint> {
        Arc::new(InternalEndpoint::new(
            EndpointKey::new(QName::local("sub"), name),
            Some(ComponentNameSpace::new("node", "c1")),
            Vec::new(),
        ))
    }

    #[test]
    fn criteria_and_filter_are_combined() {
        let reg = SubscriptionRegistry::new();
        let owner = ComponentNameSpace::new("node", "c1");
        let orders = QName::local("orders");
        reg.register(
            SubscriptionSpec::new(owner.clone()).with_service(orders.clone()),
            endpoint("all-orders"),
        );
        reg.register(
            SubscriptionSpec::new(owner.clone())
                .with_service(orders.clone())
                .with_filter(Arc::new(HighPriority)),
            endpoint("urgent-orders"),
        );

        let low = Exchange {
            service: Some(orders.clone()),
            operation: None,
            priority: 1,
        };
        let high = Exchange {
            service: Some(orders),
            operation: None,
            priority: 9,
        };
        let other = Exchange {
            service: Some(QName::local("billing")),
            operation: None,
            priority: 9,
        };

        assert_eq!(reg.matching_endpoints(&low).len(), 1);
        let names: Vec<_> = reg
            .matching_endpoints(&high)
            .iter()
            .map(|e| e.endpoint_name().to_owned())
            .collect();
        assert_eq!(names, ["all-orders", "urgent-orders"]);
        assert!(reg.matching_endpoints(&other).is_empty());
    }

    #[test]
    fn deregistration_by_id_and_component() {
        let reg = SubscriptionRegistry::new();
        let c1 = ComponentNameSpace::new("node", "c1");
        let c2 = ComponentNameSpace::new("node", "c2");
        let id = reg.register(SubscriptionSpec::new(c1.clone()), endpoint("a"));
        reg.register(SubscriptionSpec::new(c1.clone()), endpoint("b"));
        reg.register(SubscriptionSpec::new(c2.clone()), endpoint("c"));

        assert!(reg.deregister(id));
        assert!(!reg.deregister(id));
        assert_eq!(reg.subscriptions_for_component(&c1).len(), 1);
        assert_eq!(reg.deregister_for_component(&c1), 1);
        assert_eq!(reg.len(), 1);
    }
}
