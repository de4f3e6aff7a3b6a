//! Worker runtime adapter: one contract over the two supported backends
//!
//! Upper layers are parameterized by [`Runtime`] and never by backend kind;
//! dispatch is a match over the two variants, mirroring the handle shape.

use crate::config::{BackendConfig, BackendKind};
use crate::docker::{ContainerHandle, DockerRuntime};
use crate::process::{ProcessHandle, ProcessRuntime};
use std::time::Duration;

/// Four-value summary of a worker's runtime-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Running,
    Exited,
    NotFound,
}

/// Opaque reference to the process or container owned by a worker
#[derive(Debug)]
pub enum RuntimeHandle {
    Process(ProcessHandle),
    Container(ContainerHandle),
}

impl RuntimeHandle {
    /// Runtime-native identifier: PID or short container id
    pub fn runtime_id(&self) -> String {
        match self {
            RuntimeHandle::Process(p) => p.pid().to_string(),
            RuntimeHandle::Container(c) => c.short_id().to_string(),
        }
    }

    /// Cheap clonable reference for state queries, so callers can observe a
    /// worker's runtime without borrowing the handle across await points
    pub fn state_probe(&self) -> StateProbe {
        match self {
            RuntimeHandle::Process(p) => StateProbe::Process(p.exit_receiver()),
            RuntimeHandle::Container(c) => StateProbe::Container(c.id.clone()),
        }
    }
}

/// Detached reference to a worker's runtime entity
#[derive(Debug, Clone)]
pub enum StateProbe {
    Process(tokio::sync::watch::Receiver<Option<i32>>),
    Container(String),
}

/// The backend driving worker lifecycles
pub enum Runtime {
    Process(ProcessRuntime),
    Docker(DockerRuntime),
}

impl Runtime {
    pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        match config.kind {
            BackendKind::Local => Ok(Runtime::Process(ProcessRuntime::from_config(config)?)),
            BackendKind::Docker => Ok(Runtime::Docker(DockerRuntime::from_config(config).await?)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Runtime::Process(_) => "process",
            Runtime::Docker(_) => "docker",
        }
    }

    /// Image backing the workers, if this is a container backend
    pub fn image(&self) -> Option<&str> {
        match self {
            Runtime::Process(_) => None,
            Runtime::Docker(d) => Some(d.image()),
        }
    }

    /// One-time startup preparation (image pull according to policy)
    pub async fn prepare(&self) -> anyhow::Result<()> {
        match self {
            Runtime::Process(_) => Ok(()),
            Runtime::Docker(d) => d.prepare().await,
        }
    }

    /// Start a worker bound to `port` on localhost
    pub async fn create(&self, name: &str, port: u16) -> anyhow::Result<RuntimeHandle> {
        match self {
            Runtime::Process(p) => Ok(RuntimeHandle::Process(p.create(port).await?)),
            Runtime::Docker(d) => Ok(RuntimeHandle::Container(d.create(name, port).await?)),
        }
    }

    /// Gracefully terminate a worker, escalating to a force kill after the
    /// backend's grace window. Idempotent.
    pub async fn terminate(&self, handle: RuntimeHandle) -> anyhow::Result<()> {
        match (self, handle) {
            (Runtime::Process(p), RuntimeHandle::Process(h)) => p.terminate(h).await,
            (Runtime::Docker(d), RuntimeHandle::Container(h)) => d.terminate(h).await,
            _ => anyhow::bail!("runtime handle does not belong to this backend"),
        }
    }

    /// Query the runtime for a worker's lifecycle state
    pub async fn state(&self, probe: &StateProbe) -> RuntimeState {
        match (self, probe) {
            (Runtime::Process(_), StateProbe::Process(exit_rx)) => {
                if exit_rx.borrow().is_some() {
                    RuntimeState::Exited
                } else {
                    RuntimeState::Running
                }
            }
            (Runtime::Docker(d), StateProbe::Container(id)) => d.state_by_id(id).await,
            _ => RuntimeState::NotFound,
        }
    }

    /// Names of runtime entities owned by a prior controller lifetime.
    /// Subprocess backends cannot reclaim orphans and return nothing.
    pub async fn list_owned(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Runtime::Process(_) => Ok(Vec::new()),
            Runtime::Docker(d) => d.list_owned().await,
        }
    }

    /// Terminate an orphaned runtime entity by name
    pub async fn remove_orphan(&self, name: &str) -> anyhow::Result<()> {
        match self {
            Runtime::Process(_) => Ok(()),
            Runtime::Docker(d) => d.remove_container(name).await,
        }
    }

    /// Bounded window a freshly spawned worker gets to pass its first probe
    pub fn warmup_window(&self) -> Duration {
        match self {
            Runtime::Process(_) => Duration::from_secs(10),
            Runtime::Docker(_) => Duration::from_secs(30),
        }
    }
}
