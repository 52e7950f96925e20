//! Worker registry
//!
//! The registry is the single source of truth for worker identity and state.
//! It keeps two maps behind one readers-writer lock:
//! - routing key -> worker record
//! - (owner_id, worker_id) -> routing key the pair is bound to
//!
//! Every read hands out clones, so callers never observe a record while it is
//! being mutated. When a snapshot path is configured the whole record map is
//! rewritten after each mutation, while the write lock is still held, so the
//! file always reflects a linearized state.

use crate::worker::{HistoryRecord, RoutingKey, Worker};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors returned by registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The worker record does not carry a valid identity
    #[error(transparent)]
    Invalid(#[from] crate::worker::ValidationError),

    /// The pair is already bound to another key, or the key to another pair
    #[error("worker {owner_id}/{worker_id} conflicts with existing routing key {existing}")]
    Conflict {
        owner_id: String,
        worker_id: String,
        existing: String,
    },
}

/// Result of a successful `set`
#[derive(Debug, Clone)]
pub struct SetOutcome {
    /// True when the worker is new or its image changed
    pub image_changed: bool,
    /// The record as committed (or as already on file for a no-op)
    pub worker: Worker,
}

type Identity = (String, String);

#[derive(Default)]
struct Inner {
    workers: HashMap<RoutingKey, Worker>,
    index: HashMap<Identity, RoutingKey>,
}

impl Inner {
    fn insert(&mut self, key: RoutingKey, worker: Worker) {
        self.index.insert(
            (worker.owner_id.clone(), worker.worker_id.clone()),
            key.clone(),
        );
        self.workers.insert(key, worker);
    }
}

/// Concurrency-safe index of registered workers
pub struct Registry {
    inner: RwLock<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl Registry {
    /// Create an empty registry without persistence
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Create a registry backed by a snapshot file.
    ///
    /// A missing file yields an empty registry. A file that cannot be read or
    /// parsed is an error: starting empty would overwrite it on the next
    /// mutation.
    pub fn with_snapshot<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match std::fs::read_to_string(&path) {
            Ok(content) => load_snapshot(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No worker snapshot found, starting empty");
                Inner::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read worker snapshot {}: {}",
                    path.display(),
                    e
                ))
            }
        };

        Ok(Self {
            inner: RwLock::new(inner),
            snapshot_path: Some(path),
        })
    }

    /// Register or update a worker
    pub fn set(&self, mut worker: Worker) -> Result<SetOutcome, RegistryError> {
        let key = worker.routing_key()?;
        let identity = (worker.owner_id.clone(), worker.worker_id.clone());

        let mut inner = self.inner.write();

        if let Some(existing_key) = inner.index.get(&identity) {
            if *existing_key != key {
                return Err(RegistryError::Conflict {
                    owner_id: worker.owner_id,
                    worker_id: worker.worker_id,
                    existing: existing_key.to_string(),
                });
            }
        }

        if let Some(existing) = inner.workers.get(&key) {
            if existing.owner_id != worker.owner_id || existing.worker_id != worker.worker_id {
                return Err(RegistryError::Conflict {
                    owner_id: worker.owner_id,
                    worker_id: worker.worker_id,
                    existing: key.to_string(),
                });
            }
            if existing.image == worker.image {
                debug!(key = %key, image = %worker.image, "Image unchanged, skipping update");
                return Ok(SetOutcome {
                    image_changed: false,
                    worker: existing.clone(),
                });
            }
            worker.history = existing.history.clone();
        } else {
            worker.history.clear();
        }

        worker.history.push(HistoryRecord {
            image: worker.image.clone(),
            updated_at: Utc::now(),
        });

        info!(
            key = %key,
            image = %worker.image,
            port = worker.port,
            revision = worker.history.len(),
            "Worker registered"
        );

        inner.insert(key, worker.clone());
        self.persist(&inner);

        Ok(SetOutcome {
            image_changed: true,
            worker,
        })
    }

    /// Register a worker unless its routing key is already on file.
    ///
    /// Returns `None` when the existing record was kept. Used for startup
    /// seeds, which must not override state restored from the snapshot.
    pub fn seed(&self, worker: Worker) -> Result<Option<SetOutcome>, RegistryError> {
        let key = worker.routing_key()?;
        if self.get(&key).is_some() {
            debug!(key = %key, "Worker already registered, keeping existing record");
            return Ok(None);
        }
        self.set(worker).map(Some)
    }

    pub fn get(&self, key: &RoutingKey) -> Option<Worker> {
        self.inner.read().workers.get(key).cloned()
    }

    /// Remove a worker and its index entry, returning the removed record
    pub fn delete(&self, key: &RoutingKey) -> Option<Worker> {
        let mut inner = self.inner.write();
        let removed = inner.workers.remove(key)?;
        inner
            .index
            .remove(&(removed.owner_id.clone(), removed.worker_id.clone()));
        info!(key = %key, image = %removed.image, "Worker deleted");
        self.persist(&inner);
        Some(removed)
    }

    /// Copy of every record, sorted by routing key
    pub fn list(&self) -> Vec<(RoutingKey, Worker)> {
        let inner = self.inner.read();
        let mut workers: Vec<_> = inner
            .workers
            .iter()
            .map(|(k, w)| (k.clone(), w.clone()))
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0));
        workers
    }

    pub fn len(&self) -> usize {
        self.inner.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the snapshot file. Caller holds the write lock.
    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = write_snapshot(path, inner) {
            error!(path = %path.display(), error = %e, "Failed to write worker snapshot");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn load_snapshot(path: &Path, content: &str) -> anyhow::Result<Inner> {
    let records: HashMap<String, Worker> = serde_json::from_str(content).map_err(|e| {
        anyhow::anyhow!("Failed to parse worker snapshot {}: {}", path.display(), e)
    })?;

    let mut inner = Inner::default();
    for (raw_key, worker) in records {
        let key = match RoutingKey::parse(&raw_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %raw_key, error = %e, "Skipping snapshot entry with invalid routing key");
                continue;
            }
        };
        match worker.routing_key() {
            Err(e) => {
                warn!(key = %raw_key, error = %e, "Skipping snapshot entry with invalid identity");
                continue;
            }
            Ok(derived) if derived != key => {
                warn!(
                    key = %key,
                    owner_id = %worker.owner_id,
                    worker_id = %worker.worker_id,
                    "Snapshot entry is keyed differently from its identity, keeping stored key"
                );
            }
            Ok(_) => {}
        }
        inner.insert(key, worker);
    }

    info!(path = %path.display(), workers = inner.workers.len(), "Loaded worker snapshot");
    Ok(inner)
}

fn write_snapshot(path: &Path, inner: &Inner) -> anyhow::Result<()> {
    let records: BTreeMap<String, &Worker> = inner
        .workers
        .iter()
        .map(|(k, w)| (k.to_string(), w))
        .collect();
    let data = serde_json::to_vec_pretty(&records)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), workers = records.len(), "Worker snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn nginx(image: &str) -> Worker {
        Worker::new("nginx", "acme", image, 80)
    }

    fn key(s: &str) -> RoutingKey {
        RoutingKey::parse(s).unwrap()
    }

    #[test]
    fn test_set_new_worker() {
        let registry = Registry::new();
        let outcome = registry.set(nginx("nginx:1.0")).unwrap();

        assert!(outcome.image_changed);
        assert_eq!(outcome.worker.history.len(), 1);
        assert_eq!(outcome.worker.history[0].image, "nginx:1.0");

        let stored = registry.get(&key("nginx.acme")).unwrap();
        assert_eq!(stored.image, "nginx:1.0");
        assert_eq!(stored.port, 80);
    }

    #[test]
    fn test_set_same_image_is_noop() {
        let registry = Registry::new();
        registry.set(nginx("nginx:1.0")).unwrap();

        let mut again = nginx("nginx:1.0");
        again.port = 8080;
        let outcome = registry.set(again).unwrap();

        assert!(!outcome.image_changed);
        let stored = registry.get(&key("nginx.acme")).unwrap();
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.port, 80);
    }

    #[test]
    fn test_history_grows_in_order() {
        let registry = Registry::new();
        for image in ["nginx:1.0", "nginx:1.1", "nginx:1.1", "nginx:1.2"] {
            registry.set(nginx(image)).unwrap();
        }

        let stored = registry.get(&key("nginx.acme")).unwrap();
        let images: Vec<_> = stored.history.iter().map(|h| h.image.as_str()).collect();
        assert_eq!(images, vec!["nginx:1.0", "nginx:1.1", "nginx:1.2"]);
        assert!(stored
            .history
            .windows(2)
            .all(|w| w[0].updated_at <= w[1].updated_at));
        assert_eq!(stored.image, "nginx:1.2");
    }

    #[test]
    fn test_caller_supplied_history_is_ignored() {
        let registry = Registry::new();
        let mut worker = nginx("nginx:1.0");
        worker.history.push(HistoryRecord {
            image: "forged".to_string(),
            updated_at: Utc::now(),
        });

        let outcome = registry.set(worker).unwrap();
        assert_eq!(outcome.worker.history.len(), 1);
        assert_eq!(outcome.worker.history[0].image, "nginx:1.0");
    }

    #[test]
    fn test_set_rejects_invalid_identity() {
        let registry = Registry::new();
        let err = registry
            .set(Worker::new("Bad", "acme", "nginx:1.0", 80))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delete_then_set_starts_fresh() {
        let registry = Registry::new();
        registry.set(nginx("nginx:1.0")).unwrap();
        registry.set(nginx("nginx:1.1")).unwrap();

        let removed = registry.delete(&key("nginx.acme")).unwrap();
        assert_eq!(removed.history.len(), 2);
        assert!(registry.get(&key("nginx.acme")).is_none());

        let outcome = registry.set(nginx("nginx:1.1")).unwrap();
        assert!(outcome.image_changed);
        assert_eq!(outcome.worker.history.len(), 1);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let registry = Registry::new();
        assert!(registry.delete(&key("ghost.acme")).is_none());
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = Registry::new();
        registry.set(nginx("nginx:1.0")).unwrap();
        registry
            .set(Worker::new("api", "acme", "api:1", 3000))
            .unwrap();

        let listed = registry.list();
        registry.delete(&key("nginx.acme"));
        registry.set(Worker::new("api", "acme", "api:2", 3000)).unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.to_string(), "api.acme");
        assert_eq!(listed[0].1.image, "api:1");
        assert_eq!(listed[1].0.to_string(), "nginx.acme");
    }

    #[test]
    fn test_same_worker_id_different_owners() {
        let registry = Registry::new();
        registry.set(nginx("nginx:1.0")).unwrap();
        registry
            .set(Worker::new("nginx", "other", "nginx:1.0", 80))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");

        {
            let registry = Registry::with_snapshot(&path).unwrap();
            assert!(registry.is_empty());
            registry.set(nginx("nginx:1.0")).unwrap();
            registry.set(nginx("nginx:1.1")).unwrap();
            registry.set(Worker::new("api", "acme", "api:1", 3000)).unwrap();
            registry.delete(&key("api.acme"));
        }

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("nginx.acme").is_some());
        assert!(raw.get("api.acme").is_none());

        let reloaded = Registry::with_snapshot(&path).unwrap();
        let stored = reloaded.get(&key("nginx.acme")).unwrap();
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.image, "nginx:1.1");

        let outcome = reloaded.set(nginx("nginx:1.1")).unwrap();
        assert!(!outcome.image_changed);
    }

    #[test]
    fn test_snapshot_malformed_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Registry::with_snapshot(&path).is_err());
    }

    #[test]
    fn test_conflict_with_pair_bound_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let legacy = serde_json::json!({
            "nginx.legacy": {
                "worker_id": "nginx",
                "owner_id": "acme",
                "image": "nginx:0.9",
                "port": 80,
                "history": []
            }
        });
        std::fs::write(&path, legacy.to_string()).unwrap();

        let registry = Registry::with_snapshot(&path).unwrap();
        let err = registry.set(nginx("nginx:1.0")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                owner_id: "acme".to_string(),
                worker_id: "nginx".to_string(),
                existing: "nginx.legacy".to_string(),
            }
        );

        // The record on file is untouched
        let stored = registry.get(&key("nginx.legacy")).unwrap();
        assert_eq!(stored.image, "nginx:0.9");
        assert!(registry.get(&key("nginx.acme")).is_none());

        // A different pair cannot take over the key held by nginx/acme
        let err = registry
            .set(Worker::new("nginx", "legacy", "nginx:1.0", 80))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[test]
    fn test_snapshot_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing_dir").join("workers.json");

        let registry = Registry::with_snapshot(&path).unwrap();
        let outcome = registry.set(nginx("nginx:1.0")).unwrap();
        assert!(outcome.image_changed);
        assert!(registry.get(&key("nginx.acme")).is_some());
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_sets_are_serialized() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .set(nginx(&format!("nginx:{}", i % 2)))
                        .unwrap()
                        .image_changed
                })
            })
            .collect();

        let changed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();

        let stored = registry.get(&key("nginx.acme")).unwrap();
        assert_eq!(stored.history.len(), changed);
        assert_eq!(stored.history.last().unwrap().image, stored.image);
    }

    #[test]
    fn test_seed_keeps_snapshot_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");

        let registry = Registry::with_snapshot(&path).unwrap();
        registry.set(nginx("nginx:1.0")).unwrap();
        registry.set(nginx("nginx:1.1")).unwrap();
        drop(registry);

        let restored = Registry::with_snapshot(&path).unwrap();
        assert!(restored.seed(nginx("nginx:1.0")).unwrap().is_none());

        let worker = restored.get(&key("nginx.acme")).unwrap();
        assert_eq!(worker.image, "nginx:1.1");
        assert_eq!(worker.history.len(), 2);

        let reloaded = Registry::with_snapshot(&path).unwrap();
        assert_eq!(reloaded.get(&key("nginx.acme")).unwrap().history.len(), 2);
    }

    #[test]
    fn test_seed_registers_new_worker() {
        let registry = Registry::new();
        let outcome = registry.seed(nginx("nginx:1.0")).unwrap().unwrap();
        assert!(outcome.image_changed);
        assert_eq!(registry.len(), 1);

        let invalid = Worker::new("Bad", "acme", "x:1", 80);
        assert!(matches!(registry.seed(invalid), Err(RegistryError::Invalid(_))));
    }
}
