//! Worker records: the central entity of the pool

use crate::runtime::RuntimeHandle;
use std::time::Instant;
use uuid::Uuid;

/// Lifecycle phase of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    /// Spawned, waiting for the first successful health probe
    Starting,
    /// Serving traffic
    Running,
    /// Termination has begun; no longer dispatched to
    Draining,
    /// Runtime has confirmed exit
    Stopped,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "starting"),
            WorkerPhase::Running => write!(f, "running"),
            WorkerPhase::Draining => write!(f, "draining"),
            WorkerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// A managed backend worker: one subprocess or container plus its request
/// accounting. All mutation goes through the [`Registry`](crate::registry::Registry).
#[derive(Debug)]
pub struct Worker {
    /// Stable identity assigned at creation
    pub id: Uuid,
    /// Human-readable name, `<prefix>-<short id>`
    pub name: String,
    /// Host-side port; never reused within a controller lifetime
    pub port: u16,
    /// Handle to the subprocess or container; taken when draining begins
    pub handle: Option<RuntimeHandle>,
    pub phase: WorkerPhase,
    /// False until the first 200 OK health probe
    pub healthy: bool,
    /// Most recent 200 OK probe; drives the unhealthy-eviction timeout
    pub last_healthy: Option<Instant>,
    /// In-flight proxied requests
    pub active_requests: u64,
    /// Monotonic count of dispatches to this worker
    pub total_requests: u64,
    /// Most recent dispatch; initialized to spawn time so a fresh worker is
    /// not immediately an idle-eviction candidate
    pub last_request: Instant,
    /// Most recent observed full-response latency; overwritten per sample
    pub response_time_ms: Option<u64>,
}

impl Worker {
    pub fn new(id: Uuid, name: String, port: u16) -> Self {
        Self {
            id,
            name,
            port,
            handle: None,
            phase: WorkerPhase::Starting,
            healthy: false,
            last_healthy: None,
            active_requests: 0,
            total_requests: 0,
            last_request: Instant::now(),
            response_time_ms: None,
        }
    }

    /// Whether the dispatcher may route to this worker
    pub fn is_eligible(&self) -> bool {
        self.healthy && self.phase == WorkerPhase::Running
    }

    pub fn load(&self) -> f64 {
        load_score(self.active_requests, self.response_time_ms)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            name: self.name.clone(),
            port: self.port,
            runtime_id: self.handle.as_ref().map(|h| h.runtime_id()),
            phase: self.phase,
            healthy: self.healthy,
            last_healthy: self.last_healthy,
            active_requests: self.active_requests,
            total_requests: self.total_requests,
            last_request: self.last_request,
            response_time_ms: self.response_time_ms,
        }
    }
}

/// Per-worker load: queue depth plus a sub-unit penalty for responses slower
/// than 100 ms, saturating at 1.0 per second of latency.
pub fn load_score(active_requests: u64, response_time_ms: Option<u64>) -> f64 {
    let latency_penalty = response_time_ms
        .map(|ms| (ms as f64 - 100.0).max(0.0) / 1000.0)
        .unwrap_or(0.0);
    active_requests as f64 + latency_penalty
}

/// Consistent point-in-time copy of a worker's scalar fields, for readers
/// that must not hold the registry lock across suspension points.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub port: u16,
    pub runtime_id: Option<String>,
    pub phase: WorkerPhase,
    pub healthy: bool,
    pub last_healthy: Option<Instant>,
    pub active_requests: u64,
    pub total_requests: u64,
    pub last_request: Instant,
    pub response_time_ms: Option<u64>,
}

impl WorkerSnapshot {
    pub fn is_eligible(&self) -> bool {
        self.healthy && self.phase == WorkerPhase::Running
    }

    pub fn load(&self) -> f64 {
        load_score(self.active_requests, self.response_time_ms)
    }
}

/// Derive the short form of a worker id used in names and logs
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
