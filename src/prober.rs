//! Health probing for pool workers
//!
//! One pooled HTTP client issues every probe. Outcomes are applied to the
//! registry by the controller; this module owns the wire mechanics, the
//! warm-up wait, and the eviction rule.

use crate::worker::{WorkerPhase, WorkerSnapshot};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a worker may stay unhealthy before it is evicted
pub const UNHEALTHY_EVICTION_WINDOW: Duration = Duration::from_secs(60);

/// Cadence of warm-up probing after spawn
const WARMUP_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 200 OK within the timeout; `latency` is the full probe round trip
    Healthy { latency: Duration },
    /// Non-200, transport error, or timeout
    Unhealthy,
}

pub struct ProbeClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    endpoint: String,
    timeout: Duration,
}

impl ProbeClient {
    pub fn new(health_endpoint: &str, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .build(connector);

        Self {
            client,
            endpoint: health_endpoint.to_string(),
            timeout,
        }
    }

    /// Probe one worker's health endpoint
    pub async fn probe(&self, port: u16) -> ProbeOutcome {
        let uri = format!("http://localhost:{}{}", port, self.endpoint);
        let req = match Request::builder().uri(&uri).body(Empty::<Bytes>::new()) {
            Ok(r) => r,
            Err(_) => return ProbeOutcome::Unhealthy,
        };

        let start = Instant::now();
        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => ProbeOutcome::Healthy {
                latency: start.elapsed(),
            },
            Ok(Ok(response)) => {
                debug!(port, status = %response.status(), "Health probe returned non-200");
                ProbeOutcome::Unhealthy
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "Health probe failed");
                ProbeOutcome::Unhealthy
            }
            Err(_) => {
                debug!(port, timeout_ms = self.timeout.as_millis(), "Health probe timed out");
                ProbeOutcome::Unhealthy
            }
        }
    }

    /// Warm-up wait: probe at 1 s cadence until the first 200 OK or the
    /// window closes. Returns the successful probe's latency, or `None` on
    /// warm-up failure.
    pub async fn wait_for_healthy(&self, port: u16, window: Duration) -> Option<Duration> {
        let deadline = Instant::now() + window;
        loop {
            if let ProbeOutcome::Healthy { latency } = self.probe(port).await {
                return Some(latency);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(WARMUP_PROBE_INTERVAL).await;
        }
    }
}

/// Whether a worker has been unhealthy long enough to evict
pub fn eviction_due(worker: &WorkerSnapshot, now: Instant) -> bool {
    if worker.healthy || worker.phase != WorkerPhase::Running {
        return false;
    }
    match worker.last_healthy {
        Some(last) => now.duration_since(last) > UNHEALTHY_EVICTION_WINDOW,
        None => false,
    }
}
