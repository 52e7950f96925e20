//! Connection pool for backend HTTP connections
//!
//! Requests are forwarded through a pooled hyper client. Bodies are streamed
//! in both directions; nothing is buffered here.

use crate::router::Target;
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client, including connect failures
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the backend request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to worker backends
pub struct ConnectionPool {
    client: Client<HttpConnector, UnsyncBoxBody<Bytes, hyper::Error>>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward a request to `target`, preserving method, headers and body
    /// and rewriting `Host` to the target authority
    pub async fn send_request<B>(
        &self,
        req: Request<B>,
        target: &Target,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let backend_req = rewrite_request(req, target)?.map(BodyExt::boxed_unsync);
        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Point a request at the target backend
fn rewrite_request<B>(req: Request<B>, target: &Target) -> Result<Request<B>, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = target
        .uri_for(path)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
    let host = HeaderValue::from_str(&target.authority())
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    parts.headers.insert(HOST, host);
    Ok(Request::from_parts(parts, body))
}
