//! Endpoint reference (EPR) fragments and the two built-in address formats.
//!
//! XML parsing is done by the caller; the container only sees the element tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::naming::QName;

/// Namespace of the container's own reference format.
pub const JBI_EPR_NAMESPACE: &str = "http://java.sun.com/jbi/end-point-reference";
const JBI_EPR_ELEMENT: &str = "end-point-reference";
const JBI_EPR_SERVICE_ATTR: &str = "service-name";
const JBI_EPR_ENDPOINT_ATTR: &str = "end-point-name";

/// Recognised WS-Addressing namespaces.
pub const WSA_NAMESPACES: [&str; 2] = [
    "http://www.w3.org/2005/08/addressing",
    "http://schemas.xmlsoap.org/ws/2004/08/addressing",
];
const WSA_ELEMENT: &str = "EndpointReference";
const WSA_ADDRESS: &str = "Address";

const ENDPOINT_SCHEME: &str = "endpoint:";
const SERVICE_SCHEME: &str = "service:";

/// A parsed XML element: name, attributes, in-scope prefixes, children and text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EprFragment {
    pub namespace: String,
    pub local_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// In-scope namespace declarations, prefix to URI.
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<EprFragment>,
    #[serde(default)]
    pub text: String,
}

impl EprFragment {
    pub fn element(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.insert(prefix.into(), uri.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: EprFragment) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// The JBI reference format:
    /// `<jbi:end-point-reference jbi:service-name="p:svc" jbi:end-point-name="ep"/>`.
    #[must_use]
    pub fn jbi_reference(service: &QName, endpoint: &str) -> Self {
        Self::element(JBI_EPR_NAMESPACE, JBI_EPR_ELEMENT)
            .with_namespace("svc", service.namespace())
            .with_attribute(JBI_EPR_SERVICE_ATTR, format!("svc:{}", service.local_part()))
            .with_attribute(JBI_EPR_ENDPOINT_ATTR, endpoint)
    }

    /// A WS-Addressing reference whose `Address` is `uri`.
    #[must_use]
    pub fn ws_addressing(uri: impl Into<String>) -> Self {
        Self::element(WSA_NAMESPACES[0], WSA_ELEMENT)
            .with_child(Self::element(WSA_NAMESPACES[0], WSA_ADDRESS).with_text(uri))
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .or_else(|| {
                // Attributes may be recorded with their prefix.
                self.attributes
                    .iter()
                    .find(|(k, _)| k.rsplit_once(':').is_some_and(|(_, local)| local == name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Resolve `prefix:local` against the in-scope prefixes, or accept Clark notation.
    fn resolve_qname(&self, raw: &str) -> Option<QName> {
        let raw = raw.trim();
        if raw.starts_with('{') {
            return raw.parse().ok();
        }
        match raw.split_once(':') {
            Some((prefix, local)) if !local.is_empty() => {
                let ns = self.namespaces.get(prefix)?;
                Some(QName::new(ns.clone(), local))
            }
            Some(_) => None,
            None => {
                let default_ns = self.namespaces.get("").cloned().unwrap_or_default();
                Some(QName::new(default_ns, raw))
            }
        }
    }
}

/// Service and endpoint named by a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub service: QName,
    pub endpoint: String,
}

impl ResolvedReference {
    pub fn new(service: QName, endpoint: impl Into<String>) -> Self {
        Self {
            service,
            endpoint: endpoint.into(),
        }
    }
}

/// Try the JBI format first, then WS-Addressing.
#[must_use]
pub fn parse_reference(fragment: &EprFragment) -> Option<ResolvedReference> {
    parse_jbi_reference(fragment).or_else(|| parse_ws_addressing(fragment))
}

fn parse_jbi_reference(fragment: &EprFragment) -> Option<ResolvedReference> {
    if fragment.namespace != JBI_EPR_NAMESPACE || fragment.local_name != JBI_EPR_ELEMENT {
        return None;
    }
    let service = fragment.resolve_qname(fragment.attribute(JBI_EPR_SERVICE_ATTR)?)?;
    let endpoint = fragment.attribute(JBI_EPR_ENDPOINT_ATTR)?.trim();
    if endpoint.is_empty() {
        return None;
    }
    Some(ResolvedReference::new(service, endpoint))
}

fn parse_ws_addressing(fragment: &EprFragment) -> Option<ResolvedReference> {
    if !WSA_NAMESPACES.contains(&fragment.namespace.as_str()) || fragment.local_name != WSA_ELEMENT
    {
        return None;
    }
    let address = fragment
        .children
        .iter()
        .find(|c| c.local_name == WSA_ADDRESS && WSA_NAMESPACES.contains(&c.namespace.as_str()))?;
    parse_address(address.text.trim())
}

/// `endpoint:<ns><sep><service><sep><endpoint>` or `service:<ns><sep><service>`.
///
/// The separator is `/` when the address contains one (URL namespaces) and
/// `:` otherwise (URN namespaces). Parts are split from the right.
fn parse_address(uri: &str) -> Option<ResolvedReference> {
    if let Some(rest) = uri.strip_prefix(ENDPOINT_SCHEME) {
        let sep = separator(rest);
        let (head, endpoint) = rest.rsplit_once(sep)?;
        let (ns, local) = head.rsplit_once(sep)?;
        if local.is_empty() || endpoint.is_empty() {
            return None;
        }
        return Some(ResolvedReference::new(QName::new(ns, local), endpoint));
    }
    if let Some(rest) = uri.strip_prefix(SERVICE_SCHEME) {
        let sep = separator(rest);
        let (ns, local) = rest.rsplit_once(sep)?;
        if local.is_empty() {
            return None;
        }
        // A service address names the endpoint after the service.
        return Some(ResolvedReference::new(QName::new(ns, local), local));
    }
    None
}

fn separator(rest: &str) -> char {
    if rest.contains('/') { '/' } else { ':' }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn jbi_reference_resolves_prefixed_service() {
        let svc = QName::new("urn:acme", "orders");
        let epr = EprFragment::jbi_reference(&svc, "main");
        let resolved = parse_reference(&epr).unwrap();
        assert_eq!(resolved.service, svc);
        assert_eq!(resolved.endpoint, "main");
    }

    #[test]
    fn jbi_reference_accepts_prefixed_attribute_names() {
        let epr = EprFragment::element(JBI_EPR_NAMESPACE, "end-point-reference")
            .with_attribute("jbi:service-name", "{urn:acme}orders")
            .with_attribute("jbi:end-point-name", "main");
        let resolved = parse_reference(&epr).unwrap();
        assert_eq!(resolved.service.to_string(), "{urn:acme}orders");
    }

    #[test]
    fn jbi_reference_with_unknown_prefix_is_rejected() {
        let epr = EprFragment::element(JBI_EPR_NAMESPACE, "end-point-reference")
            .with_attribute("service-name", "x:orders")
            .with_attribute("end-point-name", "main");
        assert!(parse_reference(&epr).is_none());
    }

    #[test]
    fn ws_addressing_url_namespace_uses_slash() {
        let epr = EprFragment::ws_addressing("endpoint:http://acme.org/ns/orders/main");
        let resolved = parse_reference(&epr).unwrap();
        assert_eq!(resolved.service, QName::new("http://acme.org/ns", "orders"));
        assert_eq!(resolved.endpoint, "main");
    }

    #[test]
    fn ws_addressing_urn_namespace_uses_colon() {
        let epr = EprFragment::ws_addressing("endpoint:urn:acme:orders:main");
        let resolved = parse_reference(&epr).unwrap();
        assert_eq!(resolved.service, QName::new("urn:acme", "orders"));
        assert_eq!(resolved.endpoint, "main");
    }

    #[test]
    fn ws_addressing_service_form_names_endpoint_after_service() {
        let epr = EprFragment::ws_addressing("service:urn:acme:orders");
        let resolved = parse_reference(&epr).unwrap();
        assert_eq!(resolved.service, QName::new("urn:acme", "orders"));
        assert_eq!(resolved.endpoint, "orders");
    }

    #[test]
    fn unrelated_fragments_do_not_resolve() {
        assert!(parse_reference(&EprFragment::element("urn:other", "thing")).is_none());
        assert!(parse_reference(&EprFragment::ws_addressing("http://acme.org/x")).is_none());
        assert!(parse_reference(&EprFragment::ws_addressing("endpoint:nothing")).is_none());
    }
}
