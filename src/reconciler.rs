//! Cluster reconciliation for registered workers
//!
//! Each worker is converged onto three resources, all named after the
//! worker's service name:
//! - a Deployment running the worker image with one replica
//! - a Service giving the Deployment a stable in-cluster address
//! - a Traefik IngressRoute binding the public hostname (with TLS) to the Service
//!
//! The orchestration API is reached through the [`Orchestrator`] trait so the
//! step logic here is independent of the Kubernetes client.

use crate::config::ClusterConfig;
use crate::resolver::WORKER_LABEL;
use crate::worker::{RoutingKey, Worker};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kinds of cluster resources managed per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Deployment managing the worker pods
    Workload,
    /// Service in front of the workload
    Endpoint,
    /// IngressRoute exposing the endpoint publicly
    Route,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Workload, Self::Endpoint, Self::Route];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Workload => "deployment",
            Self::Endpoint => "service",
            Self::Route => "ingressroute",
        })
    }
}

/// Desired state of one cluster resource
#[derive(Debug, Clone)]
pub enum Manifest {
    Workload(Deployment),
    Endpoint(Service),
    Route(DynamicObject),
}

impl Manifest {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Workload(_) => ResourceKind::Workload,
            Self::Endpoint(_) => ResourceKind::Endpoint,
            Self::Route(_) => ResourceKind::Route,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Workload(d) => &d.metadata,
            Self::Endpoint(s) => &s.metadata,
            Self::Route(r) => &r.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Workload(d) => &mut d.metadata,
            Self::Endpoint(s) => &mut s.metadata,
            Self::Route(r) => &mut r.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }
}

/// Operations the reconciler needs from the orchestration API.
///
/// `get` returns the live object's metadata or `None` if it does not exist;
/// `delete` returns `false` if there was nothing to delete.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<ObjectMeta>, kube::Error>;
    async fn create(&self, manifest: &Manifest) -> Result<(), kube::Error>;
    async fn replace(&self, manifest: &Manifest) -> Result<(), kube::Error>;
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<bool, kube::Error>;
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{op} {kind}/{name} failed: {source}")]
    Api {
        op: &'static str,
        kind: ResourceKind,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("{op} {kind}/{name} timed out after {after:?}")]
    Timeout {
        op: &'static str,
        kind: ResourceKind,
        name: String,
        after: Duration,
    },

    #[error("failed to delete {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

/// What an upsert step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// How to treat a resource that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnExisting {
    Replace,
    Keep,
}

/// GroupVersionKind of the Traefik IngressRoute custom resource
pub fn ingress_route_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("traefik.io", "v1alpha1", "IngressRoute");
    ApiResource::from_gvk_with_plural(&gvk, "ingressroutes")
}

/// Builds manifests for a worker from the cluster settings
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    domain: String,
    worker_namespace: String,
    ingress_namespace: String,
    tls_secret: String,
    entry_points: Vec<String>,
}

impl ManifestBuilder {
    pub fn new(config: &ClusterConfig, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            worker_namespace: config.worker_namespace.clone(),
            ingress_namespace: config.ingress_namespace.clone(),
            tls_secret: config.tls_secret.clone(),
            entry_points: config.entry_points.clone(),
        }
    }

    /// Public hostname served by the IngressRoute
    pub fn public_host(&self, key: &RoutingKey) -> String {
        format!("{}.{}.{}", key.service_name(), WORKER_LABEL, self.domain)
    }

    fn labels(key: &RoutingKey, with_app: bool) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if with_app {
            labels.insert("app".to_string(), key.service_name());
        }
        labels.insert("worker_id".to_string(), key.worker_id().to_string());
        labels.insert("owner_id".to_string(), key.owner_id().to_string());
        labels
    }

    fn selector(key: &RoutingKey) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), key.service_name())])
    }

    fn meta(&self, key: &RoutingKey, namespace: &str, with_app: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some(key.service_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(Self::labels(key, with_app)),
            ..Default::default()
        }
    }

    pub fn workload(&self, key: &RoutingKey, worker: &Worker) -> Deployment {
        let name = key.service_name();
        Deployment {
            metadata: self.meta(key, &self.worker_namespace, true),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(Self::selector(key)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(Self::labels(key, true)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name,
                            image: Some(worker.image.clone()),
                            ports: Some(vec![ContainerPort {
                                container_port: i32::from(worker.port),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn endpoint(&self, key: &RoutingKey, worker: &Worker) -> Service {
        Service {
            metadata: self.meta(key, &self.worker_namespace, true),
            spec: Some(ServiceSpec {
                selector: Some(Self::selector(key)),
                ports: Some(vec![ServicePort {
                    port: i32::from(worker.port),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn route(&self, key: &RoutingKey, worker: &Worker) -> DynamicObject {
        let name = key.service_name();
        let mut route = DynamicObject::new(&name, &ingress_route_resource())
            .within(&self.ingress_namespace)
            .data(serde_json::json!({
                "spec": {
                    "entryPoints": self.entry_points,
                    "routes": [{
                        "match": format!("Host(`{}`)", self.public_host(key)),
                        "kind": "Rule",
                        "services": [{
                            "name": name,
                            "namespace": self.worker_namespace,
                            "port": worker.port,
                        }],
                    }],
                    "tls": {
                        "secretName": self.tls_secret,
                    },
                }
            }));
        route.metadata.labels = Some(Self::labels(key, false));
        route
    }
}

/// Reconciler bound to a live orchestration API
pub struct ClusterReconciler {
    api: Arc<dyn Orchestrator>,
    manifests: ManifestBuilder,
    api_timeout: Duration,
}

impl ClusterReconciler {
    pub fn new(api: Arc<dyn Orchestrator>, manifests: ManifestBuilder, api_timeout: Duration) -> Self {
        Self {
            api,
            manifests,
            api_timeout,
        }
    }

    async fn call<T, F>(
        &self,
        op: &'static str,
        kind: ResourceKind,
        name: &str,
        fut: F,
    ) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.api_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ClusterError::Api {
                op,
                kind,
                name: name.to_string(),
                source,
            }),
            Err(_) => Err(ClusterError::Timeout {
                op,
                kind,
                name: name.to_string(),
                after: self.api_timeout,
            }),
        }
    }

    async fn upsert(&self, mut manifest: Manifest, on_existing: OnExisting) -> Result<Applied, ClusterError> {
        let kind = manifest.kind();
        let name = manifest.name().to_string();

        let live = self.call("get", kind, &name, self.api.get(kind, &name)).await?;
        let applied = match live {
            None => {
                self.call("create", kind, &name, self.api.create(&manifest)).await?;
                Applied::Created
            }
            Some(_) if on_existing == OnExisting::Keep => Applied::Unchanged,
            Some(live) => {
                manifest.metadata_mut().resource_version = live.resource_version;
                self.call("replace", kind, &name, self.api.replace(&manifest)).await?;
                Applied::Updated
            }
        };

        debug!(%kind, name, ?applied, "Resource reconciled");
        Ok(applied)
    }

    /// Converge the worker's resources, stopping at the first failing step
    pub async fn deploy(&self, key: &RoutingKey, worker: &Worker) -> Result<[Applied; 3], ClusterError> {
        let workload = self
            .upsert(Manifest::Workload(self.manifests.workload(key, worker)), OnExisting::Replace)
            .await?;
        // An existing Service is left alone so its cluster address stays stable
        let endpoint = self
            .upsert(Manifest::Endpoint(self.manifests.endpoint(key, worker)), OnExisting::Keep)
            .await?;
        let route = self
            .upsert(Manifest::Route(self.manifests.route(key, worker)), OnExisting::Replace)
            .await?;

        info!(
            key = %key,
            image = %worker.image,
            host = %self.manifests.public_host(key),
            ?workload,
            ?endpoint,
            ?route,
            "Worker deployed"
        );
        Ok([workload, endpoint, route])
    }

    /// Delete every resource of the worker, attempting each one independently
    pub async fn delete(&self, key: &RoutingKey) -> Result<(), ClusterError> {
        let name = key.service_name();
        let mut failures = Vec::new();

        for kind in ResourceKind::ALL {
            match self.call("delete", kind, &name, self.api.delete(kind, &name)).await {
                Ok(true) => debug!(%kind, name, "Resource deleted"),
                Ok(false) => debug!(%kind, name, "Resource already absent"),
                Err(e) => {
                    warn!(%kind, name, error = %e, "Failed to delete resource");
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            info!(key = %key, "Worker resources deleted");
            Ok(())
        } else {
            Err(ClusterError::Cleanup(failures))
        }
    }
}

/// Cluster capability, decided once at startup
pub enum Reconciler {
    Cluster(ClusterReconciler),
    Disabled,
}

impl Reconciler {
    /// Connect to the cluster described by `config`, falling back to a
    /// disabled reconciler when the API cannot be used.
    pub async fn connect(config: &ClusterConfig) -> Self {
        if !config.enabled {
            info!("Cluster reconciliation disabled by configuration");
            return Self::Disabled;
        }
        let Some(domain) = config.domain.as_deref().filter(|d| !d.is_empty()) else {
            warn!("No cluster domain configured (set cluster.domain or DOMAIN), cluster reconciliation disabled");
            return Self::Disabled;
        };

        match crate::k8s::KubeOrchestrator::connect(config).await {
            Ok(api) => {
                info!(
                    domain,
                    worker_namespace = %config.worker_namespace,
                    ingress_namespace = %config.ingress_namespace,
                    "Cluster reconciliation enabled"
                );
                Self::Cluster(ClusterReconciler::new(
                    Arc::new(api),
                    ManifestBuilder::new(config, domain),
                    config.api_timeout(),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Kubernetes API unavailable (running outside cluster?), cluster reconciliation disabled");
                Self::Disabled
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }

    pub async fn deploy(&self, key: &RoutingKey, worker: &Worker) -> Result<(), ClusterError> {
        match self {
            Self::Cluster(cluster) => cluster.deploy(key, worker).await.map(|_| ()),
            Self::Disabled => {
                debug!(key = %key, "Cluster reconciliation disabled, skipping deploy");
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &RoutingKey) -> Result<(), ClusterError> {
        match self {
            Self::Cluster(cluster) => cluster.delete(key).await,
            Self::Disabled => {
                debug!(key = %key, "Cluster reconciliation disabled, skipping delete");
                Ok(())
            }
        }
    }
}
