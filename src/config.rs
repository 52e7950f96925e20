use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `cluster.domain`
pub const DOMAIN_ENV: &str = "DOMAIN";

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker snapshot persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Kubernetes reconciliation settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Workers registered at startup
    #[serde(default)]
    pub workers: Vec<SeedWorker>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port for both the control API and tenant traffic (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Deadline for a proxied request to produce response headers (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum accepted control API request body (default: 64 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// Snapshot file; no persistence when unset
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Reconcile workers into the cluster (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base domain; public hosts are `<service>.worker.<domain>`
    pub domain: Option<String>,

    /// Namespace for Deployments and Services (default: worker)
    #[serde(default = "default_worker_namespace")]
    pub worker_namespace: String,

    /// Namespace for IngressRoutes (default: ingress)
    #[serde(default = "default_ingress_namespace")]
    pub ingress_namespace: String,

    /// Pre-provisioned TLS secret referenced by IngressRoutes
    #[serde(default = "default_tls_secret")]
    pub tls_secret: String,

    /// Traefik entry points for IngressRoutes
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,

    /// Deadline for each orchestrator API call in seconds (default: 10)
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: None,
            worker_namespace: default_worker_namespace(),
            ingress_namespace: default_ingress_namespace(),
            tls_secret: default_tls_secret(),
            entry_points: default_entry_points(),
            api_timeout_secs: default_api_timeout(),
        }
    }
}

/// A worker declared in the config file
#[derive(Debug, Deserialize, Clone)]
pub struct SeedWorker {
    pub worker_id: String,
    pub owner_id: String,
    pub image: String,
    pub port: u16,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_worker_namespace() -> String {
    "worker".to_string()
}

fn default_ingress_namespace() -> String {
    "ingress".to_string()
}

fn default_tls_secret() -> String {
    "ingress-tls".to_string()
}

fn default_entry_points() -> Vec<String> {
    vec!["websecure".to_string()]
}

fn default_api_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(std::env::var(DOMAIN_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self, domain: Option<String>) {
        if let Some(domain) = domain.filter(|d| !d.trim().is_empty()) {
            self.cluster.domain = Some(domain.trim().to_string());
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be non-zero".to_string());
        }
        if self.cluster.api_timeout_secs == 0 {
            errors.push("cluster.api_timeout_secs must be non-zero".to_string());
        }
        if self.cluster.worker_namespace.is_empty() || self.cluster.ingress_namespace.is_empty() {
            errors.push("cluster namespaces must not be empty".to_string());
        }
        if self.cluster.entry_points.is_empty() {
            errors.push("cluster.entry_points must not be empty".to_string());
        }
        if let Some(domain) = &self.cluster.domain {
            if domain.starts_with('.') || domain.ends_with('.') || domain.contains(':') {
                errors.push(format!("cluster.domain '{}' is not a bare domain name", domain));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
