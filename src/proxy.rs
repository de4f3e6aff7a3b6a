//! Reverse-proxy data path
//!
//! Every non-reserved request is dispatched to the least-loaded healthy
//! worker and streamed through a pooled upstream client. Request accounting
//! is released exactly once per dispatch, on the completion event of the
//! response stream, so the autoscaler never observes a phantom-quiescent
//! worker.

use crate::controller::Controller;
use crate::dispatch::{Dispatcher, InFlight};
use crate::error::{self, full_body, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hard timeout on the upstream connection and response headers
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths owned by the controller itself; never proxied
const STATUS_PATH: &str = "/lb-status";
const CONTROLLER_HEALTH_PATH: &str = "/health";

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the pooled HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error rebuilding the request for the worker
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "Client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// Configuration for the pooled upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections per worker
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP client for worker connections
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamPool {
    pub fn new(config: UpstreamConfig) -> Self {
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
            "Upstream connection pool initialized"
        );

        Self { client }
    }

    /// Forward a client request to the worker on `port`, streaming the body.
    /// The original method, path, query, and headers are preserved; `Host`
    /// is rewritten to the worker's address.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://localhost:{}{}", port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }
        let host = HeaderValue::from_str(&format!("localhost:{}", port))
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;
        builder = builder.header(HOST, host);

        let worker_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        Ok(self.client.request(worker_req).await?)
    }
}

/// Response body wrapper that releases request accounting exactly once when
/// the stream completes. A clean end records the full-response latency; an
/// errored or abandoned stream releases without touching the latency sample.
struct MeteredBody {
    inner: ProxyBody,
    accounting: Option<(Dispatcher, InFlight, Instant)>,
}

impl MeteredBody {
    fn new(inner: ProxyBody, dispatcher: Dispatcher, flight: InFlight, started: Instant) -> Self {
        Self {
            inner,
            accounting: Some((dispatcher, flight, started)),
        }
    }

    fn release(&mut self, completed: bool) {
        if let Some((dispatcher, flight, started)) = self.accounting.take() {
            let latency = completed.then(|| started.elapsed());
            dispatcher.complete(flight, latency);
        }
    }
}

impl Body for MeteredBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(None) => this.release(true),
            Poll::Ready(Some(Err(_))) => this.release(false),
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        // Covers a client that disconnects mid-stream and the case where the
        // server finishes via is_end_stream without a final poll.
        let completed = self.inner.is_end_stream();
        self.release(completed);
    }
}

/// The proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    controller: Arc<Controller>,
    upstream: Arc<UpstreamPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket. A bind failure is fatal at startup.
    pub async fn bind(
        addr: SocketAddr,
        controller: Arc<Controller>,
        upstream_config: UpstreamConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy listener on {}: {}", addr, e))?;
        Ok(Self {
            listener,
            controller,
            upstream: Arc::new(UpstreamPool::new(upstream_config)),
            shutdown_rx,
        })
    }

    /// Actual bound address, useful when binding port 0
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Proxy server listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let upstream = Arc::clone(&self.upstream);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, controller, upstream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    controller: Arc<Controller>,
    upstream: Arc<UpstreamPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let controller = Arc::clone(&controller);
        let upstream = Arc::clone(&upstream);
        async move { handle_request(req, controller, upstream).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error from {}: {}", addr, e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    controller: Arc<Controller>,
    upstream: Arc<UpstreamPool>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Reserved controller endpoints are never proxied
    match req.uri().path() {
        STATUS_PATH => return Ok(status_response(&controller, req.method())),
        CONTROLLER_HEALTH_PATH => return Ok(controller_health_response(&controller, req.method())),
        _ => {}
    }

    let Some(flight) = controller.dispatcher().checkout() else {
        let (total, healthy) = controller.counts();
        debug!(total, healthy, "No eligible worker, failing fast");
        return Ok(error::no_healthy_workers(total, healthy));
    };

    let port = flight.port;
    let dispatcher = controller.dispatcher().clone();
    debug!(port, method = %req.method(), uri = %req.uri(), "Proxying request");

    let started = Instant::now();
    let result = tokio::time::timeout(UPSTREAM_TIMEOUT, upstream.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => {
            // Accounting is released when the response stream completes
            let (parts, body) = response.into_parts();
            let metered = MeteredBody::new(body.boxed(), dispatcher, flight, started);
            Ok(Response::from_parts(parts, metered.boxed()))
        }
        Ok(Err(e)) => {
            error!(port, error = %e, "Upstream request failed");
            dispatcher.complete(flight, None);
            Ok(error::bad_gateway())
        }
        Err(_) => {
            warn!(
                port,
                timeout_secs = UPSTREAM_TIMEOUT.as_secs(),
                "Upstream request timed out"
            );
            dispatcher.complete(flight, None);
            Ok(error::gateway_timeout())
        }
    }
}

fn status_response(controller: &Controller, method: &Method) -> Response<ProxyBody> {
    if method != Method::GET {
        return method_not_allowed();
    }
    let body = serde_json::to_string(&controller.status())
        .unwrap_or_else(|_| r#"{"error":"status serialization failed"}"#.to_string());
    json_response(StatusCode::OK, body)
}

fn controller_health_response(controller: &Controller, method: &Method) -> Response<ProxyBody> {
    if method != Method::GET {
        return method_not_allowed();
    }
    let body = json!({
        "status": "healthy",
        "uptime": controller.uptime().as_secs(),
        "instances": controller.status(),
    });
    json_response(StatusCode::OK, body.to_string())
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn method_not_allowed() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header("Allow", "GET")
        .body(full_body(""))
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_config_default() {
        let config = UpstreamConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_reserved_paths() {
        assert_eq!(STATUS_PATH, "/lb-status");
        assert_eq!(CONTROLLER_HEALTH_PATH, "/health");
    }
}
