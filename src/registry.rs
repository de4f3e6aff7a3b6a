//! Worker registry: the single in-process owner of all pool mutations
//!
//! The pool and its port allocator live behind one `parking_lot` lock so
//! every mutation is a short, non-suspending critical section. Readers that
//! run across await points (prober, autoscaler, status) take snapshots.

use crate::worker::{short_id, Worker, WorkerPhase, WorkerSnapshot};
use crate::runtime::{RuntimeHandle, StateProbe};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PoolInner {
    /// Insertion-ordered; order is the dispatch and status tie-break
    workers: Vec<Worker>,
    /// Monotonic; ports are never reused within a controller lifetime
    next_port: u16,
}

/// Identity of a freshly reserved pool slot
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub port: u16,
    pub name: String,
}

/// Result of moving a worker into Draining: the runtime handle to terminate
#[derive(Debug)]
pub struct DrainTicket {
    pub id: Uuid,
    pub handle: Option<RuntimeHandle>,
}

pub struct Registry {
    inner: RwLock<PoolInner>,
    max_instances: usize,
}

impl Registry {
    pub fn new(base_port: u16, max_instances: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                workers: Vec::new(),
                next_port: base_port,
            }),
            max_instances,
        }
    }

    /// Reserve a pool slot and port for a worker about to be created.
    ///
    /// Allocation and insertion happen in one critical section, so the pool
    /// can never exceed `max_instances` even under concurrent spawns. The
    /// worker enters the pool in `Starting` with no runtime handle; a failed
    /// create must release the slot with [`remove`](Self::remove).
    pub fn reserve(&self, name_prefix: &str) -> anyhow::Result<Reservation> {
        let mut inner = self.inner.write();
        if inner.workers.len() >= self.max_instances {
            anyhow::bail!(
                "worker pool is at capacity ({} instances)",
                self.max_instances
            );
        }
        let port = inner.next_port;
        inner.next_port = inner.next_port.checked_add(1).ok_or_else(|| {
            anyhow::anyhow!("port allocator exhausted at {}", port)
        })?;
        let id = Uuid::new_v4();
        let name = format!("{}-{}", name_prefix, short_id(&id));
        inner.workers.push(Worker::new(id, name.clone(), port));
        debug!(worker_id = %id, port, name, "Reserved pool slot");
        Ok(Reservation { id, port, name })
    }

    /// Attach the runtime handle produced by a successful create call
    pub fn attach_handle(&self, id: Uuid, handle: RuntimeHandle) -> bool {
        let mut inner = self.inner.write();
        match inner.workers.iter_mut().find(|w| w.id == id) {
            Some(w) => {
                w.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Move a worker into Draining and take its runtime handle for
    /// termination. Returns `None` if the worker is unknown or already
    /// draining, so concurrent retire attempts collapse into one.
    pub fn begin_drain(&self, id: Uuid) -> Option<DrainTicket> {
        let mut inner = self.inner.write();
        let w = inner.workers.iter_mut().find(|w| w.id == id)?;
        if w.phase == WorkerPhase::Draining {
            return None;
        }
        w.phase = WorkerPhase::Draining;
        w.healthy = false;
        info!(worker_id = %id, name = w.name, port = w.port, "Worker draining");
        Some(DrainTicket {
            id,
            handle: w.handle.take(),
        })
    }

    /// Remove a worker from the pool. Stopped workers are never listed.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write();
        match inner.workers.iter().position(|w| w.id == id) {
            Some(pos) => {
                let mut w = inner.workers.remove(pos);
                w.phase = WorkerPhase::Stopped;
                info!(
                    worker_id = %id,
                    name = w.name,
                    remaining = inner.workers.len(),
                    "Worker removed from pool"
                );
                true
            }
            None => false,
        }
    }

    /// Record a successful health probe: the worker becomes healthy, its
    /// latency sample is overwritten, and a Starting worker advances to
    /// Running.
    pub fn record_probe_success(&self, id: Uuid, latency: Duration) {
        let mut inner = self.inner.write();
        if let Some(w) = inner.workers.iter_mut().find(|w| w.id == id) {
            if w.phase == WorkerPhase::Draining || w.phase == WorkerPhase::Stopped {
                return;
            }
            let was_healthy = w.healthy;
            w.healthy = true;
            w.last_healthy = Some(Instant::now());
            w.response_time_ms = Some(latency.as_millis() as u64);
            if w.phase == WorkerPhase::Starting {
                w.phase = WorkerPhase::Running;
                info!(worker_id = %id, name = w.name, port = w.port, "Worker is ready");
            } else if !was_healthy {
                info!(worker_id = %id, name = w.name, "Worker recovered");
            }
        }
    }

    /// Record a failed health probe (non-200, transport error, or timeout).
    /// Phase is unchanged; eviction is the prober's 60 s rule.
    pub fn record_probe_failure(&self, id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(w) = inner.workers.iter_mut().find(|w| w.id == id) {
            if w.healthy {
                warn!(worker_id = %id, name = w.name, port = w.port, "Worker marked unhealthy");
            }
            w.healthy = false;
        }
    }

    /// In-flight request count for a worker, if it is still pooled
    pub fn active_requests(&self, id: Uuid) -> Option<u64> {
        let inner = self.inner.read();
        inner
            .workers
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.active_requests)
    }

    /// Point-in-time copy of the pool in insertion order
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let inner = self.inner.read();
        inner.workers.iter().map(Worker::snapshot).collect()
    }

    /// Detached runtime references for every live worker, for state queries
    /// that must not hold the registry lock across await points
    pub fn state_probes(&self) -> Vec<(Uuid, StateProbe)> {
        let inner = self.inner.read();
        inner
            .workers
            .iter()
            .filter(|w| matches!(w.phase, WorkerPhase::Starting | WorkerPhase::Running))
            .filter_map(|w| w.handle.as_ref().map(|h| (w.id, h.state_probe())))
            .collect()
    }

    /// (total, healthy) worker counts
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let total = inner.workers.len();
        let healthy = inner.workers.iter().filter(|w| w.is_eligible()).count();
        (total, healthy)
    }

    pub fn len(&self) -> usize {
        self.inner.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the pool under the write lock. `f` must not block: this is
    /// the critical section that makes dispatch pick-plus-increment atomic.
    pub(crate) fn with_workers_mut<R>(&self, f: impl FnOnce(&mut [Worker]) -> R) -> R {
        let mut inner = self.inner.write();
        f(&mut inner.workers)
    }
}
