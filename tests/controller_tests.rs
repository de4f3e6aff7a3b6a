//! Integration tests for the pool controller and proxy data path
//!
//! Worker backends are simulated with in-process hyper servers registered
//! directly in the registry, so the tests exercise dispatch, proxying,
//! accounting, and the status endpoints without a container runtime.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use scalegate::config::{BackendConfig, Config, ScalingConfig, ServerConfig};
use scalegate::controller::Controller;
use scalegate::proxy::{ProxyServer, UpstreamConfig};
use scalegate::runtime::Runtime;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Spawn a stub worker: 200 on /health, echoes the body on /echo, and a
/// fixed payload everywhere else. Returns its port.
async fn spawn_worker_stub() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    let response = match path.as_str() {
                        "/health" => Response::new(Full::new(Bytes::from(r#"{"status":"ok"}"#))),
                        "/echo" => {
                            let body = req.into_body().collect().await?.to_bytes();
                            Response::new(Full::new(body))
                        }
                        _ => Response::new(Full::new(Bytes::from("hello from worker"))),
                    };
                    Ok::<_, hyper::Error>(response)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

/// Controller over a local-process backend that is never actually spawned;
/// workers are registered by hand at `base_port`.
async fn test_controller(base_port: u16) -> (Arc<Controller>, watch::Sender<bool>) {
    let config = Config {
        server: ServerConfig::default(),
        scaling: ScalingConfig {
            base_port,
            ..ScalingConfig::default()
        },
        backend: BackendConfig::local("true"),
    };
    let runtime = Runtime::from_config(&config.backend).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (Controller::new(config, runtime, shutdown_rx), shutdown_tx)
}

/// Bind the proxy on an ephemeral port and run it in the background. The
/// proxy stops when `shutdown_tx` fires or is dropped at the end of a test.
async fn start_proxy(controller: Arc<Controller>, shutdown_tx: &watch::Sender<bool>) -> u16 {
    let proxy = ProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        controller,
        UpstreamConfig::default(),
        shutdown_tx.subscribe(),
    )
    .await
    .unwrap();
    let port = proxy.local_addr().unwrap().port();
    tokio::spawn(proxy.run());
    port
}

/// Send a raw HTTP request and return the full response text
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    http_request(port, "GET", path, "").await
}

/// Body of an HTTP response (after the blank line)
fn response_body(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

/// Wait for a worker's in-flight count to settle back to zero
async fn wait_for_quiescence(controller: &Arc<Controller>) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let busy = controller
            .registry()
            .snapshot()
            .iter()
            .any(|w| w.active_requests > 0);
        if !busy {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "in-flight requests never drained"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Fast-fail behavior
// ============================================================================

#[tokio::test]
async fn test_empty_pool_fails_fast_with_503() {
    let (controller, _shutdown_tx) = test_controller(5001).await;
    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;

    let response = http_get(proxy_port, "/anything").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 503"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["error"], "No healthy backend servers available");
    assert_eq!(body["instances"], 0);
    assert_eq!(body["healthy"], 0);
}

#[tokio::test]
async fn test_unhealthy_pool_fails_fast_with_counts() {
    let (controller, _shutdown_tx) = test_controller(5001).await;
    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));
    controller.registry().record_probe_failure(r.id);

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;
    let response = http_get(proxy_port, "/anything").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 503"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["instances"], 1);
    assert_eq!(body["healthy"], 0);
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_request_proxied_to_healthy_worker() {
    let worker_port = spawn_worker_stub().await;
    let (controller, _shutdown_tx) = test_controller(worker_port).await;

    let r = controller.registry().reserve("test").unwrap();
    assert_eq!(r.port, worker_port);
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;
    let response = http_get(proxy_port, "/anything").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hello from worker"));

    wait_for_quiescence(&controller).await;
    let snap = controller.registry().snapshot();
    assert_eq!(snap[0].total_requests, 1);
    assert_eq!(snap[0].active_requests, 0);
    // Successful completion overwrote the probe's latency sample
    assert!(snap[0].response_time_ms.is_some());
}

#[tokio::test]
async fn test_request_body_streams_both_ways() {
    let worker_port = spawn_worker_stub().await;
    let (controller, _shutdown_tx) = test_controller(worker_port).await;

    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;
    let payload = "payload to echo back";
    let response = http_request(proxy_port, "POST", "/echo", payload).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(payload));
}

#[tokio::test]
async fn test_dispatch_spreads_across_equal_workers() {
    let (controller, _shutdown_tx) = test_controller(5001).await;

    let a = controller.registry().reserve("test").unwrap();
    let b = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(a.id, Duration::from_millis(5));
    controller
        .registry()
        .record_probe_success(b.id, Duration::from_millis(5));

    // With equal load the earliest-inserted worker wins; once it carries a
    // request the other becomes least loaded.
    let flight_one = controller.dispatcher().checkout().unwrap();
    let flight_two = controller.dispatcher().checkout().unwrap();
    assert_eq!(flight_one.worker_id, a.id);
    assert_eq!(flight_two.worker_id, b.id);

    controller.dispatcher().complete(flight_one, None);
    controller.dispatcher().complete(flight_two, None);

    let snap = controller.registry().snapshot();
    assert!(snap.iter().all(|w| w.active_requests == 0));
    assert!(snap.iter().all(|w| w.total_requests == 1));
}

#[tokio::test]
async fn test_upstream_refusal_yields_502_and_releases_accounting() {
    // Reserve a port with nothing listening on it
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (controller, _shutdown_tx) = test_controller(dead_port).await;
    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;
    let response = http_get(proxy_port, "/anything").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 502"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["error"], "Bad Gateway");
    assert_eq!(body["message"], "Backend server error");

    let snap = controller.registry().snapshot();
    assert_eq!(snap[0].active_requests, 0);
    // Error paths leave the latency sample untouched
    assert_eq!(snap[0].response_time_ms, Some(5));
    assert_eq!(snap[0].total_requests, 1);
}

// ============================================================================
// Reserved endpoints
// ============================================================================

#[tokio::test]
async fn test_lb_status_reports_pool() {
    let worker_port = spawn_worker_stub().await;
    let (controller, _shutdown_tx) = test_controller(worker_port).await;

    let a = controller.registry().reserve("test").unwrap();
    controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(a.id, Duration::from_millis(9));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;
    let response = http_get(proxy_port, "/lb-status").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["total"], 2);
    assert_eq!(body["healthy"], 1);
    assert!(body.get("image").is_none());

    let workers = body["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0]["healthy"], true);
    assert_eq!(workers[0]["phase"], "running");
    assert_eq!(workers[0]["response_time_ms"], 9);
    assert_eq!(workers[1]["healthy"], false);
    assert_eq!(workers[1]["phase"], "starting");
    // Container names appear only for container backends
    assert!(workers.iter().all(|w| w.get("name").is_none()));
}

#[tokio::test]
async fn test_controller_health_endpoint() {
    let (controller, _shutdown_tx) = test_controller(5001).await;
    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;

    let response = http_get(proxy_port, "/health").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["uptime"].is_number());
    assert_eq!(body["instances"]["total"], 0);
}

#[tokio::test]
async fn test_reserved_paths_never_proxied() {
    let worker_port = spawn_worker_stub().await;
    let (controller, _shutdown_tx) = test_controller(worker_port).await;

    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;

    // The stub answers /health with its own body; the controller must not
    // forward and must answer itself.
    let response = http_get(proxy_port, "/health").await.unwrap();
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body.get("instances").is_some());

    // No dispatch happened for the reserved path
    assert_eq!(controller.registry().snapshot()[0].total_requests, 0);
}

#[tokio::test]
async fn test_reserved_paths_reject_non_get() {
    let (controller, _shutdown_tx) = test_controller(5001).await;
    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;

    let response = http_request(proxy_port, "POST", "/lb-status", "").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 405"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_failed_spawn_releases_pool_slot() {
    let config = Config {
        server: ServerConfig::default(),
        scaling: ScalingConfig::default(),
        backend: BackendConfig::local("/nonexistent/worker-binary"),
    };
    let runtime = Runtime::from_config(&config.backend).await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(config, runtime, shutdown_rx);

    let err = controller.spawn_worker().await.unwrap_err();
    assert!(err.to_string().contains("failed to create worker"));
    assert!(controller.registry().is_empty());

    // The reserved port is not reissued even though the spawn failed
    let r = controller.registry().reserve("test").unwrap();
    assert_eq!(r.port, 5002);
}

#[tokio::test]
async fn test_retire_is_idempotent_under_concurrency() {
    let (controller, _shutdown_tx) = test_controller(5001).await;
    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let first = {
        let controller = Arc::clone(&controller);
        let id = r.id;
        tokio::spawn(async move { controller.retire(id).await })
    };
    let second = {
        let controller = Arc::clone(&controller);
        let id = r.id;
        tokio::spawn(async move { controller.retire(id).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert!(controller.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_empties_pool() {
    let (controller, shutdown_tx) = test_controller(5001).await;
    for _ in 0..3 {
        controller.registry().reserve("test").unwrap();
    }
    assert_eq!(controller.registry().len(), 3);

    let _ = shutdown_tx.send(true);
    controller.shutdown(Duration::from_secs(5)).await;

    assert!(controller.registry().is_empty());
}

// ============================================================================
// Concurrent accounting
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_account_exactly_once() {
    let worker_port = spawn_worker_stub().await;
    let (controller, _shutdown_tx) = test_controller(worker_port).await;

    let r = controller.registry().reserve("test").unwrap();
    controller
        .registry()
        .record_probe_success(r.id, Duration::from_millis(5));

    let proxy_port = start_proxy(Arc::clone(&controller), &_shutdown_tx).await;

    let requests: Vec<_> = (0..16)
        .map(|_| tokio::spawn(async move { http_get(proxy_port, "/work").await }))
        .collect();
    for request in requests {
        let response = request.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    wait_for_quiescence(&controller).await;
    let snap = controller.registry().snapshot();
    assert_eq!(snap[0].total_requests, 16);
    assert_eq!(snap[0].active_requests, 0);
}
