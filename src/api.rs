//! Control API for worker registration
//!
//! - `POST /api/register` registers or updates a worker and deploys it when
//!   its image changed
//! - `DELETE /api/register/{routing_key}` removes a worker and its cluster
//!   resources
//! - `GET /api/workers` lists registered workers
//! - `GET /health` and `GET /version`

use crate::error::{json_error_response, json_response, Error, ErrorCode};
use crate::reconciler::Reconciler;
use crate::registry::Registry;
use crate::worker::{RoutingKey, Worker, WorkerView};
use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const REGISTER_PATH: &str = "/api/register";
const REGISTER_PREFIX: &str = "/api/register/";

/// Request body for `POST /api/register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub owner_id: String,
    pub image: String,
    pub port: u16,
    /// Redeploy even if the image did not change
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub status: &'static str,
    pub image_changed: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

/// Handles control plane requests
pub struct ControlApi {
    registry: Arc<Registry>,
    reconciler: Arc<Reconciler>,
    /// Serializes register/delete + reconciliation per routing key
    key_locks: DashMap<RoutingKey, Arc<tokio::sync::Mutex<()>>>,
    max_body_bytes: usize,
}

impl ControlApi {
    pub fn new(registry: Arc<Registry>, reconciler: Arc<Reconciler>, max_body_bytes: usize) -> Self {
        Self {
            registry,
            reconciler,
            key_locks: DashMap::new(),
            max_body_bytes,
        }
    }

    /// True for paths served by the control API rather than proxied
    pub fn handles(method: &Method, path: &str) -> bool {
        matches!(
            (method, path),
            (&Method::GET, "/health") | (&Method::GET, "/version") | (&Method::GET, "/api/workers")
        ) || path == REGISTER_PATH
            || path.starts_with(REGISTER_PREFIX)
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(%method, %path, "Control API request");

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/health") => Ok(ok_json(&StatusResponse { status: "ok" })),
            (&Method::GET, "/version") => Ok(ok_json(&serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }))),
            (&Method::GET, "/api/workers") => Ok(self.list()),
            (&Method::POST, REGISTER_PATH) => match self.read_json::<RegisterRequest>(req).await {
                Ok(body) => self.register(body).await,
                Err(e) => Err(e),
            },
            (&Method::DELETE, path) if path.starts_with(REGISTER_PREFIX) || path == REGISTER_PATH => {
                let raw = path.strip_prefix(REGISTER_PREFIX).unwrap_or("");
                self.delete(raw).await
            }
            _ => {
                return json_error_response(
                    ErrorCode::NotFound,
                    format!("no route for {} {}", method, path),
                )
            }
        };

        result.unwrap_or_else(|e| {
            match e.code() {
                ErrorCode::ClusterUnavailable => error!(%method, %path, error = %e, "Control API request failed"),
                _ => warn!(%method, %path, error = %e, "Control API request rejected"),
            }
            e.into_response()
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, req: Request<Incoming>) -> Result<T, Error> {
        let body = Limited::new(req.into_body(), self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| Error::Validation(format!("failed to read body: {}", e)))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| Error::Validation(format!("invalid JSON: {}", e)))
    }

    fn key_lock(&self, key: &RoutingKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.key_locks.entry(key.clone()).or_default().value())
    }

    /// Drop the lock entry of a key with no worker, unless another request
    /// holds or waits on it. `held` is the caller's own handle.
    fn release_key_lock(&self, key: &RoutingKey, held: &Arc<tokio::sync::Mutex<()>>) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
    }

    /// Register a worker and deploy it if its image changed
    pub async fn register(&self, req: RegisterRequest) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        let worker = Worker::new(&req.worker_id, &req.owner_id, &req.image, req.port);
        worker.validate()?;
        let key = worker.routing_key()?;

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let outcome = self.registry.set(worker)?;

        if outcome.image_changed || req.force {
            if let Err(e) = self.reconciler.deploy(&key, &outcome.worker).await {
                return Err(Error::BackendUnavailable(e));
            }
        }

        info!(
            key = %key,
            image_changed = outcome.image_changed,
            force = req.force,
            "Register request completed"
        );

        Ok(ok_json(&RegisterResponse {
            status: "ok",
            image_changed: outcome.image_changed,
        }))
    }

    /// Remove a worker's cluster resources, then its record.
    ///
    /// The record is kept when cluster cleanup fails so the same request can
    /// be retried.
    pub async fn delete(&self, raw_key: &str) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        if raw_key.is_empty() {
            return Err(Error::Validation("routing key required".to_string()));
        }
        let key = RoutingKey::parse(raw_key)?;

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let result = self.delete_locked(&key).await;
        if self.registry.get(&key).is_none() {
            self.release_key_lock(&key, &lock);
        }
        result
    }

    async fn delete_locked(&self, key: &RoutingKey) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        if self.registry.get(key).is_none() {
            return Err(Error::NotFound(key.to_string()));
        }

        self.reconciler.delete(key).await?;
        self.registry.delete(key);
        Ok(ok_json(&StatusResponse { status: "ok" }))
    }

    fn list(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let workers: Vec<WorkerView> = self
            .registry
            .list()
            .into_iter()
            .map(|(key, worker)| WorkerView::new(&key, worker))
            .collect();
        ok_json(&workers)
    }
}

fn ok_json<T: Serialize>(value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ErrorCode::InternalError, format!("serialization failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::testing::{reconciler, FakeOrchestrator};
    use crate::reconciler::ResourceKind;
    use std::time::Duration;

    fn register_req(worker_id: &str, image: &str, force: bool) -> RegisterRequest {
        RegisterRequest {
            worker_id: worker_id.to_string(),
            owner_id: "acme".to_string(),
            image: image.to_string(),
            port: 80,
            force,
        }
    }

    fn api_with(fake: Option<Arc<FakeOrchestrator>>) -> ControlApi {
        let reconciler = match fake {
            Some(fake) => Reconciler::Cluster(reconciler(fake, Duration::from_secs(5))),
            None => Reconciler::Disabled,
        };
        ControlApi::new(Arc::new(Registry::new()), Arc::new(reconciler), 1024)
    }

    async fn body_json(response: Response<BoxBody<Bytes, hyper::Error>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_handles_control_paths() {
        assert!(ControlApi::handles(&Method::GET, "/health"));
        assert!(ControlApi::handles(&Method::GET, "/api/workers"));
        assert!(ControlApi::handles(&Method::POST, "/api/register"));
        assert!(ControlApi::handles(&Method::DELETE, "/api/register/nginx.acme"));
        assert!(!ControlApi::handles(&Method::GET, "/"));
        assert!(!ControlApi::handles(&Method::POST, "/health"));
        assert!(!ControlApi::handles(&Method::GET, "/api/other"));
    }

    #[tokio::test]
    async fn test_register_deploys_on_image_change_only() {
        let fake = Arc::new(FakeOrchestrator::default());
        let api = api_with(Some(Arc::clone(&fake)));

        let response = api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["image_changed"], true);
        assert!(fake.object(ResourceKind::Workload, "nginx-acme").is_some());

        let calls_before = fake.calls().len();
        let body = body_json(api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap()).await;
        assert_eq!(body["image_changed"], false);
        assert_eq!(fake.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_force_redeploys_unchanged_image() {
        let fake = Arc::new(FakeOrchestrator::default());
        let api = api_with(Some(Arc::clone(&fake)));
        api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();

        let calls_before = fake.calls().len();
        let body = body_json(api.register(register_req("nginx", "nginx:1.0", true)).await.unwrap()).await;
        assert_eq!(body["image_changed"], false);
        assert!(fake.calls().len() > calls_before);
    }

    #[tokio::test]
    async fn test_register_validation_errors() {
        let api = api_with(None);
        let err = api.register(register_req("Nginx", "nginx:1.0", false)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(err.to_string().contains("worker_id"));

        let mut req = register_req("nginx", "nginx:1.0", false);
        req.port = 0;
        assert_eq!(api.register(req).await.unwrap_err().code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_register_deploy_failure_keeps_registration() {
        let fake = Arc::new(FakeOrchestrator::default());
        fake.fail_on("create", ResourceKind::Route);
        let api = api_with(Some(Arc::clone(&fake)));

        let err = api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClusterUnavailable);
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let key = RoutingKey::new("nginx", "acme").unwrap();
        assert!(api.registry.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_delete_flow() {
        let fake = Arc::new(FakeOrchestrator::default());
        let api = api_with(Some(Arc::clone(&fake)));
        api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();

        let response = api.delete("nginx-acme").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(fake.object(ResourceKind::Workload, "nginx-acme").is_none());
        assert!(api.registry.is_empty());

        assert_eq!(api.delete("nginx.acme").await.unwrap_err().code(), ErrorCode::WorkerNotFound);
        assert_eq!(api.delete("").await.unwrap_err().code(), ErrorCode::InvalidRequest);
        assert_eq!(api.delete("nope").await.unwrap_err().code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_delete_cluster_failure_keeps_record_for_retry() {
        let fake = Arc::new(FakeOrchestrator::default());
        let api = api_with(Some(Arc::clone(&fake)));
        api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();
        fake.fail_on("delete", ResourceKind::Endpoint);

        let err = api.delete("nginx.acme").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClusterUnavailable);
        let key = RoutingKey::new("nginx", "acme").unwrap();
        assert!(api.registry.get(&key).is_some());
        assert!(fake.object(ResourceKind::Endpoint, "nginx-acme").is_some());

        fake.fail.lock().clear();
        let response = api.delete("nginx.acme").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(api.registry.is_empty());
        assert!(fake.object(ResourceKind::Endpoint, "nginx-acme").is_none());
    }

    #[tokio::test]
    async fn test_delete_releases_key_lock() {
        let api = api_with(None);
        api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();
        api.register(register_req("web", "web:1", false)).await.unwrap();
        assert_eq!(api.key_locks.len(), 2);

        api.delete("nginx.acme").await.unwrap();
        assert_eq!(api.key_locks.len(), 1);
        assert!(!api.key_locks.contains_key(&RoutingKey::new("nginx", "acme").unwrap()));

        api.delete("ghost.acme").await.unwrap_err();
        assert_eq!(api.key_locks.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_key_lock() {
        let fake = Arc::new(FakeOrchestrator::default());
        let api = api_with(Some(Arc::clone(&fake)));
        api.register(register_req("nginx", "nginx:1.0", false)).await.unwrap();
        fake.fail_on("delete", ResourceKind::Workload);

        api.delete("nginx.acme").await.unwrap_err();
        assert_eq!(api.key_locks.len(), 1);
    }

    #[tokio::test]
    async fn test_list_workers() {
        let api = api_with(None);
        api.register(register_req("web", "web:1", false)).await.unwrap();
        api.register(register_req("api", "api:1", false)).await.unwrap();

        let body = body_json(api.list()).await;
        let workers = body.as_array().unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0]["routing_key"], "api.acme");
        assert_eq!(workers[0]["service_name"], "api-acme");
        assert_eq!(workers[1]["image"], "web:1");
        assert_eq!(workers[1]["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registers_end_on_registry_image() {
        let fake = Arc::new(FakeOrchestrator::default());
        *fake.delay.lock() = Some(Duration::from_millis(5));
        let api = Arc::new(api_with(Some(Arc::clone(&fake))));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let api = Arc::clone(&api);
                tokio::spawn(async move {
                    api.register(register_req("nginx", &format!("nginx:{}", i), false))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let key = RoutingKey::new("nginx", "acme").unwrap();
        let registered = api.registry.get(&key).unwrap();
        let deployed = fake.object(ResourceKind::Workload, "nginx-acme").unwrap();
        let deployed_image = match deployed {
            crate::reconciler::Manifest::Workload(d) => {
                d.spec.unwrap().template.spec.unwrap().containers[0].image.clone()
            }
            _ => None,
        };
        assert_eq!(deployed_image.as_deref(), Some(registered.image.as_str()));
    }
}
