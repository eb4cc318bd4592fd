//! Service endpoints and the endpoint registry.

mod reference;
mod registry;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::naming::{ComponentNameSpace, QName};

pub use reference::{
    EprFragment, JBI_EPR_NAMESPACE, ResolvedReference, WSA_NAMESPACES, parse_reference,
};
pub use registry::EndpointRegistry;

/// Registry key of every endpoint partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub service: QName,
    pub endpoint: String,
}

impl EndpointKey {
    pub fn new(service: QName, endpoint: impl Into<String>) -> Self {
        Self {
            service,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.endpoint)
    }
}

/// How a consumer-side link must be honoured when routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Standard,
    Hard,
    Soft,
}

/// Endpoint mirrored from another container instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub service: QName,
    pub endpoint: String,
    pub component: ComponentNameSpace,
}

impl RemoteEndpoint {
    pub fn new(component: ComponentNameSpace, service: QName, endpoint: impl Into<String>) -> Self {
        Self {
            service,
            endpoint: endpoint.into(),
            component,
        }
    }

    #[must_use]
    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.service.clone(), self.endpoint.clone())
    }
}

/// Endpoint hosted by a local component, optionally mirrored by remote instances.
///
/// The record stays registered while it is local or has at least one remote
/// mirror; with remotes only it is "clustered but not local".
#[derive(Debug)]
pub struct InternalEndpoint {
    key: EndpointKey,
    owner: RwLock<Option<ComponentNameSpace>>,
    interfaces: RwLock<Vec<QName>>,
    remotes: RwLock<Vec<RemoteEndpoint>>,
}

impl InternalEndpoint {
    pub(crate) fn new(key: EndpointKey, owner: Option<ComponentNameSpace>, interfaces: Vec<QName>) -> Self {
        Self {
            key,
            owner: RwLock::new(owner),
            interfaces: RwLock::new(interfaces),
            remotes: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    #[must_use]
    pub fn service_name(&self) -> &QName {
        &self.key.service
    }

    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        &self.key.endpoint
    }

    /// Owning local component; `None` for a remote-only record.
    #[must_use]
    pub fn component(&self) -> Option<ComponentNameSpace> {
        self.owner.read().clone()
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.owner.read().is_some()
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.remotes.read().is_empty()
    }

    #[must_use]
    pub fn interfaces(&self) -> Vec<QName> {
        self.interfaces.read().clone()
    }

    #[must_use]
    pub fn implements(&self, interface: &QName) -> bool {
        self.interfaces.read().contains(interface)
    }

    #[must_use]
    pub fn remote_endpoints(&self) -> Vec<RemoteEndpoint> {
        self.remotes.read().clone()
    }

    pub(crate) fn attach(&self, owner: ComponentNameSpace, interfaces: Vec<QName>) {
        *self.owner.write() = Some(owner);
        *self.interfaces.write() = interfaces;
    }

    pub(crate) fn detach(&self) {
        *self.owner.write() = None;
    }

    pub(crate) fn add_remote(&self, remote: RemoteEndpoint) {
        let mut remotes = self.remotes.write();
        if !remotes.contains(&remote) {
            remotes.push(remote);
        }
    }

    pub(crate) fn remove_remote(&self, remote: &RemoteEndpoint) {
        self.remotes.write().retain(|r| r != remote);
    }

    /// Neither local nor mirrored: the record can be dropped.
    pub(crate) fn is_orphan(&self) -> bool {
        !self.is_local() && !self.is_clustered()
    }
}

/// Proxy exposing an internal service to external consumers under another endpoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEndpoint {
    pub key: EndpointKey,
    pub component: ComponentNameSpace,
    pub interfaces: Vec<QName>,
}

/// Alias created by a service assembly connection, keyed by the consumer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedEndpoint {
    pub from: EndpointKey,
    pub to: EndpointKey,
    pub link_type: LinkType,
}

/// Endpoint produced by a component plugin while resolving an endpoint reference.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicEndpoint {
    pub component: ComponentNameSpace,
    pub key: EndpointKey,
    pub fragment: EprFragment,
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Internal(Arc<InternalEndpoint>),
    External(Arc<ExternalEndpoint>),
    Linked(Arc<LinkedEndpoint>),
    Remote(Arc<RemoteEndpoint>),
    Dynamic(Arc<DynamicEndpoint>),
}

impl Endpoint {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::External(_) => "external",
            Self::Linked(_) => "linked",
            Self::Remote(_) => "remote",
            Self::Dynamic(_) => "dynamic",
        }
    }

    /// Address the endpoint is reachable under (the consumer side for links).
    #[must_use]
    pub fn key(&self) -> EndpointKey {
        match self {
            Self::Internal(e) => e.key().clone(),
            Self::External(e) => e.key.clone(),
            Self::Linked(e) => e.from.clone(),
            Self::Remote(e) => e.key(),
            Self::Dynamic(e) => e.key.clone(),
        }
    }

    #[must_use]
    pub fn as_internal(&self) -> Option<&Arc<InternalEndpoint>> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_linked(&self) -> Option<&Arc<LinkedEndpoint>> {
        match self {
            Self::Linked(e) => Some(e),
            _ => None,
        }
    }
}
