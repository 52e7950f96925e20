//! Host header to routing key resolution
//!
//! Two spellings of the same worker are accepted:
//! - `{worker_id}.{owner_id}.worker.<base-domain>`
//! - `{worker_id}-{owner_id}.worker.<base-domain>`
//!
//! Both resolve to the canonical key `worker_id.owner_id`.

use crate::worker::RoutingKey;
use thiserror::Error;

/// Label that separates the worker identity from the base domain
pub const WORKER_LABEL: &str = "worker";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("empty host")]
    Empty,
    #[error("host exceeds {MAX_HOSTNAME_LEN} characters")]
    TooLong,
    #[error("host '{0}' is not a worker hostname")]
    NotWorkerHost(String),
    #[error("host '{0}' has no dash separating worker and owner")]
    MissingSeparator(String),
    #[error("host '{0}' contains an invalid worker or owner id")]
    InvalidId(String),
}

/// Strip a trailing `:port`
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Resolve a request host to the routing key it addresses
pub fn resolve(host: &str) -> Result<RoutingKey, ResolveError> {
    let hostname = strip_port(host.trim()).to_ascii_lowercase();
    if hostname.is_empty() {
        return Err(ResolveError::Empty);
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(ResolveError::TooLong);
    }

    let labels: Vec<&str> = hostname.split('.').collect();

    let (worker_id, owner_id) = match labels.as_slice() {
        // worker_id-owner_id.worker.<base>
        [first, marker, ..] if *marker == WORKER_LABEL => first
            .split_once('-')
            .ok_or_else(|| ResolveError::MissingSeparator(hostname.clone()))?,
        // worker_id.owner_id.worker.<base>
        [worker_id, owner_id, marker, ..] if *marker == WORKER_LABEL => (*worker_id, *owner_id),
        _ => return Err(ResolveError::NotWorkerHost(hostname.clone())),
    };

    RoutingKey::new(worker_id, owner_id).map_err(|_| ResolveError::InvalidId(hostname.clone()))
}
