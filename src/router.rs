//! Routing key to backend target mapping

use crate::registry::Registry;
use crate::worker::RoutingKey;
use hyper::Uri;
use std::sync::Arc;

/// DNS suffix of in-cluster service addresses
pub const CLUSTER_DNS_SUFFIX: &str = "svc.cluster.local";

/// Internal address of a worker's backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `<service-name>.<namespace>.svc.cluster.local`
    pub host: String,
    pub port: u16,
}

impl Target {
    /// `host:port`, used as the forwarded `Host` header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Full backend URI for a request path
    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri, hyper::http::uri::InvalidUri> {
        format!("{}{}", self.url(), path_and_query).parse()
    }
}

/// Picks the backend for a routing key using the registry
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    namespace: String,
}

impl Router {
    pub fn new(registry: Arc<Registry>, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
        }
    }

    /// Resolve a routing key to its backend, or `None` if no worker is registered
    pub fn route(&self, key: &RoutingKey) -> Option<Target> {
        let worker = self.registry.get(key)?;
        Some(Target {
            host: format!("{}.{}.{}", key.service_name(), self.namespace, CLUSTER_DNS_SUFFIX),
            port: worker.port,
        })
    }
}
