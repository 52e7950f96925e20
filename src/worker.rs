//! Worker records and the identity types derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a DNS-1123 label, which bounds the derived service name
pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// A rejected identifier or registration field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} must contain only lowercase letters, numbers and underscores")]
    InvalidCharset { field: &'static str },
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("service name '{name}' exceeds {MAX_SERVICE_NAME_LEN} characters")]
    NameTooLong { name: String },
}

/// Returns true if `id` is a non-empty string over `[a-z0-9_]`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn check_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Missing { field });
    }
    if !is_valid_id(value) {
        return Err(ValidationError::InvalidCharset { field });
    }
    Ok(())
}

/// Canonical `worker_id.owner_id` key used for lookup and for naming cluster
/// resources.
///
/// Both ids are restricted to `[a-z0-9_]`, so neither `.` nor `-` can appear
/// inside them and the mapping from the pair to the key is bijective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey {
    worker_id: String,
    owner_id: String,
}

impl RoutingKey {
    pub fn new(worker_id: &str, owner_id: &str) -> Result<Self, ValidationError> {
        check_id("worker_id", worker_id)?;
        check_id("owner_id", owner_id)?;
        Ok(Self {
            worker_id: worker_id.to_string(),
            owner_id: owner_id.to_string(),
        })
    }

    /// Parse either the canonical dot spelling or the dash spelling
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let (worker_id, owner_id) = s
            .split_once('.')
            .or_else(|| s.split_once('-'))
            .ok_or(ValidationError::Missing { field: "owner_id" })?;
        Self::new(worker_id, owner_id)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Name shared by the cluster Deployment, Service and IngressRoute, and by
    /// the internal backend hostname the router targets.
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.worker_id, self.owner_id)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.worker_id, self.owner_id)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.to_string()
    }
}

/// One accepted image change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub image: String,
    pub updated_at: DateTime<Utc>,
}

/// A tenant's registered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub owner_id: String,
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

impl Worker {
    pub fn new(worker_id: &str, owner_id: &str, image: &str, port: u16) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            owner_id: owner_id.to_string(),
            image: image.to_string(),
            port,
            history: Vec::new(),
        }
    }

    /// Check every field a registration must carry
    pub fn validate(&self) -> Result<(), ValidationError> {
        let key = self.routing_key()?;
        if self.image.trim().is_empty() {
            return Err(ValidationError::Missing { field: "image" });
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        let name = key.service_name();
        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(ValidationError::NameTooLong { name });
        }
        Ok(())
    }

    pub fn routing_key(&self) -> Result<RoutingKey, ValidationError> {
        RoutingKey::new(&self.worker_id, &self.owner_id)
    }
}

/// Worker record as exposed by the listing endpoint
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub routing_key: String,
    pub service_name: String,
    #[serde(flatten)]
    pub worker: Worker,
}

impl WorkerView {
    pub fn new(key: &RoutingKey, worker: Worker) -> Self {
        Self {
            routing_key: key.to_string(),
            service_name: key.service_name(),
            worker,
        }
    }
}
