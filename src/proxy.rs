use crate::api::ControlApi;
use crate::error::{json_error_response, Error, ErrorCode};
use crate::pool::ConnectionPool;
use crate::resolver::{resolve, ResolveError};
use crate::router::Router;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Shared request handling state for every connection
struct Shared {
    api: Arc<ControlApi>,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

/// Listener serving the control API and forwarding tenant traffic
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        api: Arc<ControlApi>,
        router: Arc<Router>,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            shared: Arc::new(Shared {
                api,
                router,
                pool,
                request_timeout,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Router listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if ControlApi::handles(req.method(), req.uri().path()) {
        return Ok(shared.api.handle(req).await);
    }

    let resolved = request_host(&req).and_then(|host| resolve(host).map(|key| (host.to_string(), key)));
    let (host, key) = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!(error = %e, "Unresolvable host");
            return Ok(Error::RouteResolution(e).into_response());
        }
    };

    let target = match shared.router.route(&key) {
        Some(target) => target,
        None => {
            debug!(key = %key, "No worker registered for host");
            return Ok(json_error_response(
                ErrorCode::UnknownWorker,
                format!("no worker found for: {}", key),
            ));
        }
    };

    let request_id = set_proxy_headers(req.headers_mut(), client_addr, &host);

    debug!(
        key = %key,
        target = %target.url(),
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Forwarding request"
    );

    let request_timeout = shared.request_timeout;
    match tokio::time::timeout(request_timeout, shared.pool.send_request(req, &target)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(key = %key, target = %target.url(), request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Failed to connect to worker",
            ))
        }
        Err(_) => {
            warn!(
                key = %key,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Host the request addresses: the `Host` header, or the URI authority for
/// HTTP/2 requests that carry only `:authority`
fn request_host<B>(req: &Request<B>) -> Result<&str, ResolveError> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .ok_or(ResolveError::Empty)
}

/// Set request ID and `X-Forwarded-*` headers, returning the request ID.
///
/// Forwarded headers are overwritten rather than appended; this router is
/// the first trusted hop.
fn set_proxy_headers(headers: &mut HeaderMap, client_addr: SocketAddr, host: &str) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}
