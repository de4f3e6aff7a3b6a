//! Pool controller: binds runtime, registry, prober, autoscaler, and
//! dispatcher together
//!
//! The controller is designed to be used behind an `Arc` for shared
//! ownership across async tasks; the constructor returns `Arc<Self>` to
//! enforce this. Timer tasks are spawned with `Arc::clone` and stop when the
//! shutdown watch channel fires.

use crate::autoscaler::{self, ScaleAction};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::prober::{self, ProbeClient, ProbeOutcome};
use crate::registry::{Registry, Reservation};
use crate::runtime::{Runtime, RuntimeState};
use crate::worker::{WorkerPhase, WorkerSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a draining worker may hold in-flight requests before its runtime
/// is terminated anyway
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for in-flight requests to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Controller {
    registry: Arc<Registry>,
    runtime: Runtime,
    dispatcher: Dispatcher,
    probe: ProbeClient,
    config: Config,
    started_at: Instant,
    shutdown_rx: watch::Receiver<bool>,
}

impl Controller {
    /// Create a controller. Returns `Arc<Self>` because the prober and
    /// autoscaler tasks, warm-up tasks, and the proxy all share it.
    pub fn new(config: Config, runtime: Runtime, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        let registry = Arc::new(Registry::new(
            config.scaling.base_port,
            config.scaling.max_instances,
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let probe = ProbeClient::new(
            &config.scaling.health_endpoint,
            config.scaling.health_timeout(),
        );
        Arc::new(Self {
            registry,
            runtime,
            dispatcher,
            probe,
            config,
            started_at: Instant::now(),
            shutdown_rx,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn counts(&self) -> (usize, usize) {
        self.registry.counts()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Startup sequence: reclaim orphans from a prior lifetime, prepare the
    /// image, then spawn the minimum pool concurrently. Individual spawn
    /// failures are logged; the next autoscaler tick retries.
    pub async fn initialize(self: &Arc<Self>) -> anyhow::Result<()> {
        match self.runtime.list_owned().await {
            Ok(orphans) => {
                for name in orphans {
                    warn!(name, "Reclaiming orphaned worker from a previous run");
                    if let Err(e) = self.runtime.remove_orphan(&name).await {
                        warn!(name, error = %e, "Failed to remove orphan");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }

        self.runtime.prepare().await?;

        info!(
            min_instances = self.config.scaling.min_instances,
            backend = self.runtime.kind(),
            "Warming up worker pool"
        );
        let spawns = (0..self.config.scaling.min_instances).map(|_| {
            let controller = Arc::clone(self);
            async move {
                if let Err(e) = controller.spawn_worker().await {
                    error!(error = %e, "Failed to spawn worker during warm-up");
                }
            }
        });
        futures::future::join_all(spawns).await;

        Ok(())
    }

    /// Start the prober and autoscaler timer tasks
    pub fn start_background_tasks(self: &Arc<Self>) {
        let prober = Arc::clone(self);
        tokio::spawn(async move { prober.run_prober().await });

        let autoscaler = Arc::clone(self);
        tokio::spawn(async move { autoscaler.run_autoscaler().await });
    }

    /// Spawn one worker: reserve a pool slot and port, create the runtime
    /// entity, then begin warm-up probing in the background. A create
    /// failure releases the slot and surfaces as a failed scale-up.
    pub async fn spawn_worker(self: &Arc<Self>) -> anyhow::Result<()> {
        let reservation = self.registry.reserve(&self.config.backend.name_prefix)?;
        let Reservation { id, port, name } = reservation;

        let handle = match self.runtime.create(&name, port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove(id);
                return Err(e.context(format!("failed to create worker on port {}", port)));
            }
        };
        self.registry.attach_handle(id, handle);

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.warm_up(id, port).await });
        Ok(())
    }

    /// Probe a fresh worker at 1 s cadence until it is healthy or the
    /// backend's warm-up window closes; a worker that never warms up is
    /// evicted.
    async fn warm_up(self: Arc<Self>, id: Uuid, port: u16) {
        let window = self.runtime.warmup_window();
        match self.probe.wait_for_healthy(port, window).await {
            Some(latency) => {
                self.registry.record_probe_success(id, latency);
            }
            None => {
                warn!(
                    worker_id = %id,
                    port,
                    window_secs = window.as_secs(),
                    "Worker failed to become healthy within warm-up window, evicting"
                );
                self.retire(id).await;
            }
        }
    }

    /// Drain and terminate one worker, then remove it from the pool. Safe to
    /// call concurrently; only the first caller acts. A terminate failure is
    /// logged and the worker is removed from the pool regardless.
    pub async fn retire(self: &Arc<Self>, id: Uuid) {
        let Some(ticket) = self.registry.begin_drain(id) else {
            return;
        };

        // Let in-flight requests finish before signaling the runtime
        let drain_start = Instant::now();
        while self.registry.active_requests(id).unwrap_or(0) > 0 {
            if drain_start.elapsed() > DRAIN_TIMEOUT {
                let remaining = self.registry.active_requests(id).unwrap_or(0);
                warn!(worker_id = %id, remaining, "Drain timeout exceeded, terminating anyway");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if let Some(handle) = ticket.handle {
            if let Err(e) = self.runtime.terminate(handle).await {
                warn!(
                    worker_id = %id,
                    error = %e,
                    "Failed to terminate worker runtime, removing from pool anyway"
                );
            }
        }
        self.registry.remove(id);
    }

    async fn run_prober(self: Arc<Self>) {
        let interval = self.config.scaling.probe_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(interval_ms = interval.as_millis(), "Health prober started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.probe_tick().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One prober tick: probe every non-draining worker concurrently, apply
    /// the outcomes, then evict workers unhealthy beyond the window.
    async fn probe_tick(self: &Arc<Self>) {
        let pool = self.registry.snapshot();
        let probes = pool
            .iter()
            .filter(|w| matches!(w.phase, WorkerPhase::Starting | WorkerPhase::Running))
            .map(|w| {
                let (id, port) = (w.id, w.port);
                let probe = &self.probe;
                async move { (id, probe.probe(port).await) }
            });

        for (id, outcome) in futures::future::join_all(probes).await {
            match outcome {
                ProbeOutcome::Healthy { latency } => self.registry.record_probe_success(id, latency),
                ProbeOutcome::Unhealthy => self.registry.record_probe_failure(id),
            }
        }

        let now = Instant::now();
        for w in self.registry.snapshot() {
            if prober::eviction_due(&w, now) {
                warn!(
                    worker_id = %w.id,
                    name = w.name,
                    port = w.port,
                    "Worker unhealthy beyond eviction window, retiring"
                );
                let controller = Arc::clone(self);
                tokio::spawn(async move { controller.retire(w.id).await });
            }
        }

        // Reap workers whose runtime entity died out from under us, so a
        // Running worker always refers to an extant process or container
        for (id, state_probe) in self.registry.state_probes() {
            match self.runtime.state(&state_probe).await {
                RuntimeState::Exited | RuntimeState::NotFound => {
                    warn!(worker_id = %id, "Worker runtime is gone, removing from pool");
                    let controller = Arc::clone(self);
                    tokio::spawn(async move { controller.retire(id).await });
                }
                RuntimeState::Starting | RuntimeState::Running => {}
            }
        }
    }

    async fn run_autoscaler(self: Arc<Self>) {
        let interval = self.config.scaling.check_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(interval_ms = interval.as_millis(), "Autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.scale_tick().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Autoscaler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One autoscaler tick: at most one scaling action. A failed scale-up
    /// ends the tick; the next tick retries.
    async fn scale_tick(self: &Arc<Self>) {
        let pool = self.registry.snapshot();
        match autoscaler::decide(&pool, &self.config.scaling, Instant::now()) {
            ScaleAction::Up => {
                info!(pool_size = pool.len(), "Scaling up");
                if let Err(e) = self.spawn_worker().await {
                    error!(error = %e, "Scale-up failed");
                }
            }
            ScaleAction::Down(id) => {
                info!(worker_id = %id, pool_size = pool.len(), "Scaling down idle worker");
                let controller = Arc::clone(self);
                tokio::spawn(async move { controller.retire(id).await });
            }
            ScaleAction::Hold => {
                debug!(pool_size = pool.len(), "No scaling action");
            }
        }
    }

    /// Status snapshot for the `/lb-status` endpoint
    pub fn status(&self) -> PoolStatus {
        let pool = self.registry.snapshot();
        let healthy = pool.iter().filter(|w| w.is_eligible()).count();
        let is_container = self.runtime.image().is_some();
        PoolStatus {
            total: pool.len(),
            healthy,
            image: self.runtime.image().map(String::from),
            workers: pool
                .iter()
                .map(|w| WorkerStatus::from_snapshot(w, is_container))
                .collect(),
        }
    }

    /// Terminate every worker concurrently, bounded by `deadline`. Timers
    /// are assumed stopped (the shutdown channel has fired).
    pub async fn shutdown(self: &Arc<Self>, deadline: Duration) {
        let ids: Vec<Uuid> = self.registry.snapshot().iter().map(|w| w.id).collect();
        info!(workers = ids.len(), "Terminating worker pool");

        let terminations = ids.into_iter().map(|id| {
            let controller = Arc::clone(self);
            async move { controller.retire(id).await }
        });

        if tokio::time::timeout(deadline, futures::future::join_all(terminations))
            .await
            .is_err()
        {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Shutdown deadline expired with terminations outstanding"
            );
        }
    }
}

/// Snapshot served by `/lb-status`
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub healthy: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    /// PID or short container id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    /// Container name; absent for process backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    pub healthy: bool,
    pub phase: WorkerPhase,
    pub active_requests: u64,
    pub total_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub load: f64,
}

impl WorkerStatus {
    fn from_snapshot(w: &WorkerSnapshot, is_container: bool) -> Self {
        Self {
            id: w.id.to_string(),
            runtime_id: w.runtime_id.clone(),
            name: is_container.then(|| w.name.clone()),
            port: w.port,
            healthy: w.healthy,
            phase: w.phase,
            active_requests: w.active_requests,
            total_requests: w.total_requests,
            response_time_ms: w.response_time_ms,
            load: w.load(),
        }
    }
}
