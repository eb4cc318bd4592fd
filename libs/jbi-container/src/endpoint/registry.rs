use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    Endpoint, EndpointKey, ExternalEndpoint, InternalEndpoint, LinkType, LinkedEndpoint,
    RemoteEndpoint,
};
use crate::error::{JbiError, JbiResult};
use crate::events::{EndpointEventKind, EventBus};
use crate::naming::{ComponentNameSpace, QName};

/// Endpoint partitions: internal, external, linked and interface connections.
///
/// Reads never block on writers of other keys; every mutation fires an
/// endpoint event through the shared [`EventBus`].
pub struct EndpointRegistry {
    internal: DashMap<EndpointKey, Arc<InternalEndpoint>>,
    external: DashMap<EndpointKey, Arc<ExternalEndpoint>>,
    linked: DashMap<EndpointKey, Arc<LinkedEndpoint>>,
    interface_connections: DashMap<QName, EndpointKey>,
    events: Arc<EventBus>,
}

impl EndpointRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            internal: DashMap::new(),
            external: DashMap::new(),
            linked: DashMap::new(),
            interface_connections: DashMap::new(),
            events,
        }
    }

    /// Activate an endpoint for a local component.
    ///
    /// A record that only carries remote mirrors is taken over and keeps them.
    ///
    /// # Errors
    /// Returns `JbiError::DuplicateEndpoint` if a local endpoint with the same
    /// service and endpoint name is already active.
    pub fn register_internal_endpoint(
        &self,
        owner: &ComponentNameSpace,
        service: QName,
        endpoint: &str,
        interfaces: Vec<QName>,
    ) -> JbiResult<Arc<InternalEndpoint>> {
        let key = EndpointKey::new(service, endpoint);
        let registered = match self.internal.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let record = existing.get();
                if record.is_local() {
                    return Err(JbiError::DuplicateEndpoint {
                        kind: "internal",
                        service: key.service,
                        endpoint: key.endpoint,
                    });
                }
                record.attach(owner.clone(), interfaces);
                Arc::clone(record)
            }
            Entry::Vacant(slot) => {
                let record = Arc::new(InternalEndpoint::new(
                    key.clone(),
                    Some(owner.clone()),
                    interfaces,
                ));
                slot.insert(Arc::clone(&record));
                record
            }
        };
        tracing::debug!(component = %owner, endpoint = %key, "internal endpoint registered");
        self.events.fire_endpoint(
            Endpoint::Internal(Arc::clone(&registered)),
            EndpointEventKind::Registered,
        );
        Ok(registered)
    }

    /// Deactivate a local endpoint. A clustered record stays registered without an owner.
    pub fn unregister_internal_endpoint(&self, service: &QName, endpoint: &str) {
        let key = EndpointKey::new(service.clone(), endpoint);
        let Some(record) = self.internal.get(&key).map(|r| Arc::clone(r.value())) else {
            return;
        };
        if !record.is_local() {
            return;
        }
        record.detach();
        self.internal.remove_if(&key, |_, r| r.is_orphan());
        tracing::debug!(endpoint = %key, clustered = record.is_clustered(), "internal endpoint unregistered");
        self.events
            .fire_endpoint(Endpoint::Internal(record), EndpointEventKind::Unregistered);
    }

    /// Attach a remote mirror, creating a remote-only record when no local endpoint exists.
    pub fn register_remote_endpoint(&self, remote: RemoteEndpoint) -> Arc<InternalEndpoint> {
        let key = remote.key();
        let record = {
            let slot = self
                .internal
                .entry(key.clone())
                .or_insert_with(|| Arc::new(InternalEndpoint::new(key.clone(), None, Vec::new())));
            slot.add_remote(remote.clone());
            Arc::clone(slot.value())
        };
        tracing::debug!(endpoint = %key, remote = %remote.component, "remote endpoint registered");
        self.events
            .fire_endpoint(Endpoint::Remote(Arc::new(remote)), EndpointEventKind::Registered);
        record
    }

    /// Detach a remote mirror; the record goes away once it is neither local nor mirrored.
    pub fn unregister_remote_endpoint(&self, remote: &RemoteEndpoint) {
        let key = remote.key();
        let Some(record) = self.internal.get(&key).map(|r| Arc::clone(r.value())) else {
            return;
        };
        record.remove_remote(remote);
        self.internal.remove_if(&key, |_, r| r.is_orphan());
        tracing::debug!(endpoint = %key, remote = %remote.component, "remote endpoint unregistered");
        self.events.fire_endpoint(
            Endpoint::Remote(Arc::new(remote.clone())),
            EndpointEventKind::Unregistered,
        );
    }

    /// # Errors
    /// Returns `JbiError::DuplicateEndpoint` if the external address is taken.
    pub fn register_external_endpoint(
        &self,
        owner: &ComponentNameSpace,
        service: QName,
        endpoint: &str,
        interfaces: Vec<QName>,
    ) -> JbiResult<Arc<ExternalEndpoint>> {
        let key = EndpointKey::new(service, endpoint);
        let record = match self.external.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(JbiError::DuplicateEndpoint {
                    kind: "external",
                    service: key.service,
                    endpoint: key.endpoint,
                });
            }
            Entry::Vacant(slot) => {
                let record = Arc::new(ExternalEndpoint {
                    key: key.clone(),
                    component: owner.clone(),
                    interfaces,
                });
                slot.insert(Arc::clone(&record));
                record
            }
        };
        tracing::debug!(component = %owner, endpoint = %key, "external endpoint registered");
        self.events.fire_endpoint(
            Endpoint::External(Arc::clone(&record)),
            EndpointEventKind::Registered,
        );
        Ok(record)
    }

    pub fn unregister_external_endpoint(&self, service: &QName, endpoint: &str) {
        let key = EndpointKey::new(service.clone(), endpoint);
        if let Some((_, record)) = self.external.remove(&key) {
            tracing::debug!(endpoint = %key, "external endpoint unregistered");
            self.events
                .fire_endpoint(Endpoint::External(record), EndpointEventKind::Unregistered);
        }
    }

    /// Alias the consumer address `from` to the provider address `to`.
    ///
    /// # Errors
    /// Returns `JbiError::DuplicateEndpoint` if `from` is already linked.
    pub fn register_endpoint_connection(
        &self,
        from: EndpointKey,
        to: EndpointKey,
        link_type: LinkType,
    ) -> JbiResult<Arc<LinkedEndpoint>> {
        let record = match self.linked.entry(from.clone()) {
            Entry::Occupied(_) => {
                return Err(JbiError::DuplicateEndpoint {
                    kind: "linked",
                    service: from.service,
                    endpoint: from.endpoint,
                });
            }
            Entry::Vacant(slot) => {
                let record = Arc::new(LinkedEndpoint {
                    from: from.clone(),
                    to,
                    link_type,
                });
                slot.insert(Arc::clone(&record));
                record
            }
        };
        tracing::debug!(from = %record.from, to = %record.to, link_type = ?link_type, "endpoint connection registered");
        self.events.fire_endpoint(
            Endpoint::Linked(Arc::clone(&record)),
            EndpointEventKind::Registered,
        );
        Ok(record)
    }

    pub fn unregister_endpoint_connection(&self, from: &EndpointKey) {
        if let Some((_, record)) = self.linked.remove(from) {
            tracing::debug!(from = %record.from, "endpoint connection unregistered");
            self.events
                .fire_endpoint(Endpoint::Linked(record), EndpointEventKind::Unregistered);
        }
    }

    /// Wire an interface straight to one provider address.
    ///
    /// # Errors
    /// Returns `JbiError::DuplicateInterfaceConnection` if the interface is already wired.
    pub fn register_interface_connection(&self, interface: QName, to: EndpointKey) -> JbiResult<()> {
        match self.interface_connections.entry(interface) {
            Entry::Occupied(slot) => Err(JbiError::DuplicateInterfaceConnection {
                interface: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                tracing::debug!(interface = %slot.key(), to = %to, "interface connection registered");
                slot.insert(to);
                Ok(())
            }
        }
    }

    pub fn unregister_interface_connection(&self, interface: &QName) {
        if self.interface_connections.remove(interface).is_some() {
            tracing::debug!(%interface, "interface connection unregistered");
        }
    }

    /// Linked endpoints take precedence over internal ones.
    #[must_use]
    pub fn get_endpoint(&self, service: &QName, endpoint: &str) -> Option<Endpoint> {
        let key = EndpointKey::new(service.clone(), endpoint);
        if let Some(linked) = self.linked.get(&key) {
            return Some(Endpoint::Linked(Arc::clone(linked.value())));
        }
        self.internal
            .get(&key)
            .map(|e| Endpoint::Internal(Arc::clone(e.value())))
    }

    #[must_use]
    pub fn get_internal_endpoint(&self, service: &QName, endpoint: &str) -> Option<Arc<InternalEndpoint>> {
        self.internal
            .get(&EndpointKey::new(service.clone(), endpoint))
            .map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn get_external_endpoint(&self, service: &QName, endpoint: &str) -> Option<Arc<ExternalEndpoint>> {
        self.external
            .get(&EndpointKey::new(service.clone(), endpoint))
            .map(|e| Arc::clone(e.value()))
    }

    /// Internal endpoints implementing `interface`; every internal endpoint for `None`.
    ///
    /// An explicit interface connection short-circuits the search to its single target.
    #[must_use]
    pub fn get_endpoints_for_interface(&self, interface: Option<&QName>) -> Vec<Arc<InternalEndpoint>> {
        let Some(interface) = interface else {
            return self.internal_where(|_| true);
        };
        if let Some(target) = self.interface_connections.get(interface).map(|t| t.clone()) {
            return match self.get_internal_endpoint(&target.service, &target.endpoint) {
                Some(endpoint) => vec![endpoint],
                None => {
                    tracing::warn!(%interface, target = %target, "interface connection target is not registered");
                    Vec::new()
                }
            };
        }
        self.internal_where(|e| e.implements(interface))
    }

    #[must_use]
    pub fn get_endpoints_for_service(&self, service: &QName) -> Vec<Arc<InternalEndpoint>> {
        self.internal_where(|e| e.service_name() == service)
    }

    #[must_use]
    pub fn get_external_endpoints_for_interface(&self, interface: Option<&QName>) -> Vec<Arc<ExternalEndpoint>> {
        self.external_where(|e| interface.is_none_or(|i| e.interfaces.contains(i)))
    }

    #[must_use]
    pub fn get_external_endpoints_for_service(&self, service: &QName) -> Vec<Arc<ExternalEndpoint>> {
        self.external_where(|e| &e.key.service == service)
    }

    /// Local internal endpoints owned by `component`.
    #[must_use]
    pub fn get_endpoints_for_component(&self, component: &ComponentNameSpace) -> Vec<Arc<InternalEndpoint>> {
        self.internal_where(|e| e.component().as_ref() == Some(component))
    }

    #[must_use]
    pub fn get_external_endpoints_for_component(&self, component: &ComponentNameSpace) -> Vec<Arc<ExternalEndpoint>> {
        self.external_where(|e| &e.component == component)
    }

    #[must_use]
    pub fn get_linked_endpoints(&self) -> Vec<Arc<LinkedEndpoint>> {
        let mut out: Vec<_> = self.linked.iter().map(|e| Arc::clone(e.value())).collect();
        out.sort_by(|a, b| a.from.cmp(&b.from));
        out
    }

    /// Drop every endpoint a component registered (used on component shutdown).
    pub fn unregister_component_endpoints(&self, component: &ComponentNameSpace) {
        for endpoint in self.get_endpoints_for_component(component) {
            self.unregister_internal_endpoint(endpoint.service_name(), endpoint.endpoint_name());
        }
        for endpoint in self.get_external_endpoints_for_component(component) {
            self.unregister_external_endpoint(&endpoint.key.service, &endpoint.key.endpoint);
        }
    }

    fn internal_where(&self, keep: impl Fn(&InternalEndpoint) -> bool) -> Vec<Arc<InternalEndpoint>> {
        let mut out: Vec<_> = self
            .internal
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| Arc::clone(e.value()))
            .collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    fn external_where(&self, keep: impl Fn(&ExternalEndpoint) -> bool) -> Vec<Arc<ExternalEndpoint>> {
        let mut out: Vec<_> = self
            .external
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| Arc::clone(e.value()))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}
