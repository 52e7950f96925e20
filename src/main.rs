use distributor::api::{ControlApi, PKG_NAME, VERSION};
use distributor::config::{Config, SeedWorker};
use distributor::pool::{ConnectionPool, PoolConfig};
use distributor::proxy::ProxyServer;
use distributor::reconciler::Reconciler;
use distributor::registry::Registry;
use distributor::router::Router;
use distributor::worker::Worker;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("distributor=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let registry = match &config.store.path {
        Some(path) => {
            let registry = Registry::with_snapshot(path).map_err(|e| {
                error!(path = %path, error = %e, "Failed to load worker snapshot");
                e
            })?;
            info!(path = %path, workers = registry.len(), "Worker snapshot loaded");
            registry
        }
        None => {
            info!("No store path configured, workers are kept in memory only");
            Registry::new()
        }
    };
    let registry = Arc::new(registry);

    seed_workers(&registry, &config.workers);

    let reconciler = Arc::new(Reconciler::connect(&config.cluster).await);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        config.cluster.worker_namespace.clone(),
    ));
    let api = Arc::new(ControlApi::new(
        Arc::clone(&registry),
        Arc::clone(&reconciler),
        config.server.max_body_bytes,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(
        bind_addr,
        api,
        router,
        pool,
        config.server.request_timeout(),
        shutdown_rx,
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Server error");
        }
    });

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(5), server_handle).await.is_err() {
        warn!("Server did not stop within drain timeout");
    }

    info!(workers = registry.len(), "Shutdown complete");
    Ok(())
}

/// Register configured workers that are not already on file, without
/// deploying them
fn seed_workers(registry: &Registry, seeds: &[SeedWorker]) {
    for seed in seeds {
        let worker = Worker::new(&seed.worker_id, &seed.owner_id, &seed.image, seed.port);
        if let Err(e) = worker.validate() {
            warn!(worker_id = %seed.worker_id, owner_id = %seed.owner_id, error = %e, "Skipping invalid seed worker");
            continue;
        }
        match registry.seed(worker) {
            Ok(Some(_)) => info!(
                worker_id = %seed.worker_id,
                owner_id = %seed.owner_id,
                image = %seed.image,
                "Seed worker registered"
            ),
            Ok(None) => debug!(
                worker_id = %seed.worker_id,
                owner_id = %seed.owner_id,
                "Seed worker already registered, keeping stored record"
            ),
            Err(e) => warn!(worker_id = %seed.worker_id, owner_id = %seed.owner_id, error = %e, "Skipping seed worker"),
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        enabled = config.cluster.enabled,
        domain = ?config.cluster.domain,
        worker_namespace = %config.cluster.worker_namespace,
        ingress_namespace = %config.cluster.ingress_namespace,
        tls_secret = %config.cluster.tls_secret,
        entry_points = ?config.cluster.entry_points,
        api_timeout_secs = config.cluster.api_timeout_secs,
        "Cluster settings"
    );
    info!(
        store = ?config.store.path,
        seed_workers = config.workers.len(),
        "Worker store"
    );
}
