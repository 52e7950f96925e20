//! Kubernetes implementation of the orchestration API

use crate::config::ClusterConfig;
use crate::reconciler::{ingress_route_resource, Manifest, Orchestrator, ResourceKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::Client;
use tracing::info;

/// Namespaced access to Deployments, Services and IngressRoutes
pub struct KubeOrchestrator {
    client: Client,
    worker_namespace: String,
    ingress_namespace: String,
    ingress_route: ApiResource,
}

impl KubeOrchestrator {
    /// Build a client from the in-cluster or kubeconfig environment and check
    /// that the API server answers, each step bounded by the configured API timeout.
    pub async fn connect(config: &ClusterConfig) -> anyhow::Result<Self> {
        let timeout = config.api_timeout();

        let client = tokio::time::timeout(timeout, Client::try_default())
            .await
            .map_err(|_| anyhow::anyhow!("Timed out creating Kubernetes client"))?
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

        let version = tokio::time::timeout(timeout, client.apiserver_version())
            .await
            .map_err(|_| anyhow::anyhow!("Timed out reaching Kubernetes API server"))?
            .map_err(|e| anyhow::anyhow!("Kubernetes API server unreachable: {}", e))?;

        info!(version = %version.git_version, "Connected to Kubernetes API server");

        Ok(Self {
            client,
            worker_namespace: config.worker_namespace.clone(),
            ingress_namespace: config.ingress_namespace.clone(),
            ingress_route: ingress_route_resource(),
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.worker_namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.worker_namespace)
    }

    fn ingress_routes(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.ingress_namespace, &self.ingress_route)
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<ObjectMeta>, kube::Error> {
        let metadata = match kind {
            ResourceKind::Workload => self.deployments().get_opt(name).await?.map(|d| d.metadata),
            ResourceKind::Endpoint => self.services().get_opt(name).await?.map(|s| s.metadata),
            ResourceKind::Route => self.ingress_routes().get_opt(name).await?.map(|r| r.metadata),
        };
        Ok(metadata)
    }

    async fn create(&self, manifest: &Manifest) -> Result<(), kube::Error> {
        let params = PostParams::default();
        match manifest {
            Manifest::Workload(d) => {
                self.deployments().create(&params, d).await?;
            }
            Manifest::Endpoint(s) => {
                self.services().create(&params, s).await?;
            }
            Manifest::Route(r) => {
                self.ingress_routes().create(&params, r).await?;
            }
        }
        Ok(())
    }

    async fn replace(&self, manifest: &Manifest) -> Result<(), kube::Error> {
        let params = PostParams::default();
        let name = manifest.name();
        match manifest {
            Manifest::Workload(d) => {
                self.deployments().replace(name, &params, d).await?;
            }
            Manifest::Endpoint(s) => {
                self.services().replace(name, &params, s).await?;
            }
            Manifest::Route(r) => {
                self.ingress_routes().replace(name, &params, r).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<bool, kube::Error> {
        let params = DeleteParams::default();
        let result = match kind {
            ResourceKind::Workload => self.deployments().delete(name, &params).await.map(|_| ()),
            ResourceKind::Endpoint => self.services().delete(name, &params).await.map(|_| ()),
            ResourceKind::Route => self.ingress_routes().delete(name, &params).await.map(|_| ()),
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
