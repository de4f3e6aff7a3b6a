//! Local-subprocess worker runtime
//!
//! Each worker is a child process launched with `--port <n>`. A reaper task
//! owns the `Child`: it reports the exit status over a watch channel and
//! accepts a force-kill signal, so the handle itself stays shareable and
//! termination can escalate without touching the child directly.

use crate::config::BackendConfig;
use crate::runtime::RuntimeState;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Grace window between SIGTERM and SIGKILL
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Extra wait for the reaper to confirm exit after a force kill
const KILL_CONFIRM_WINDOW: Duration = Duration::from_secs(2);

pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
}

/// Handle to a spawned worker process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: watch::Sender<bool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> RuntimeState {
        if self.exit_rx.borrow().is_some() {
            RuntimeState::Exited
        } else {
            RuntimeState::Running
        }
    }

    /// Clonable view of the reaper's exit report
    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }
}

impl ProcessRuntime {
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| anyhow::anyhow!("local backend requires 'command'"))?;
        Ok(Self {
            command,
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
        })
    }

    /// Spawn a worker process listening on `port`
    pub async fn create(&self, port: u16) -> anyhow::Result<ProcessHandle> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg("--port").arg(port.to_string());
        cmd.env("PORT", port.to_string());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn worker process '{}': {}. \
                 Check that the command exists and is executable.",
                self.command,
                e
            )
        })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, port, command = %self.command, "Worker process spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        debug!(pid, code, "Worker process exited");
                        let _ = exit_tx.send(Some(code));
                        break;
                    }
                    result = kill_rx.changed() => {
                        // A dropped handle also lands here, so an orphaned
                        // worker process cannot outlive its handle.
                        if result.is_err() || *kill_rx.borrow() {
                            let _ = child.start_kill();
                            let code = child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1);
                            debug!(pid, code, "Worker process killed");
                            let _ = exit_tx.send(Some(code));
                            break;
                        }
                    }
                }
            }
        });

        Ok(ProcessHandle {
            pid,
            exit_rx,
            kill_tx,
        })
    }

    /// Signal the process to stop, wait up to the grace window, then force
    /// kill. Idempotent: an already-exited process is a no-op.
    pub async fn terminate(&self, handle: ProcessHandle) -> anyhow::Result<()> {
        let ProcessHandle {
            pid,
            mut exit_rx,
            kill_tx,
        } = handle;

        if exit_rx.borrow().is_some() {
            debug!(pid, "Worker process already exited");
            return Ok(());
        }

        info!(pid, "Sending SIGTERM to worker process");
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = kill_tx.send(true);
        }

        if wait_for_exit(&mut exit_rx, SHUTDOWN_GRACE).await {
            info!(pid, "Worker process exited gracefully");
            return Ok(());
        }

        warn!(
            pid,
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Grace period exceeded, sending SIGKILL"
        );
        let _ = kill_tx.send(true);
        if !wait_for_exit(&mut exit_rx, KILL_CONFIRM_WINDOW).await {
            anyhow::bail!("worker process {} did not exit after SIGKILL", pid);
        }
        Ok(())
    }
}

/// Wait until the reaper reports an exit status, bounded by `timeout`
async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<i32>>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while exit_rx.borrow().is_none() {
            if exit_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .is_ok()
}
