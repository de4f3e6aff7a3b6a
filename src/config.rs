use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the pool controller
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Autoscaling parameters
    #[serde(default)]
    pub scaling: ScalingConfig,

    /// Worker backend configuration (required)
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 4000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle upstream connections per worker (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScalingConfig {
    /// Lower bound on the worker pool (default: 2)
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,

    /// Upper bound on the worker pool (default: 10)
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Autoscaler tick period in milliseconds (default: 5000)
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Per-probe timeout in milliseconds (default: 2000)
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,

    /// Average load above which the pool scales up (default: 3.0)
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,

    /// Average load below which idle workers become scale-down candidates
    /// (default: 0.5)
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,

    /// Per-worker idle window in milliseconds before it may be retired
    /// (default: 30000)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// First host port handed to a worker; allocation is monotonic from here
    /// (default: 5001)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Worker health probe path (default: /health)
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
}

impl ScalingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Prober tick period: the configured interval, capped at 5 seconds.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.min(5000))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            check_interval_ms: default_check_interval(),
            health_timeout_ms: default_health_timeout(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            idle_timeout_ms: default_idle_timeout(),
            base_port: default_base_port(),
            health_endpoint: default_health_endpoint(),
        }
    }
}

/// Worker backend kind: local subprocess or Docker container
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local process spawned directly (default)
    #[default]
    Local,
    /// Docker container managed via the Docker API
    Docker,
}

/// Image pull policy for Docker backends
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull only when the image is missing locally; a failed pull is logged
    /// and startup continues (default)
    #[default]
    Missing,
    /// Always pull before starting; a failed pull is fatal
    Always,
    /// Never pull
    Never,
}

/// Configuration for the worker backend
///
/// # Security Warning
///
/// For local backends, the `command` and `args` fields allow arbitrary
/// command execution. For Docker backends, container images are pulled and
/// run. Configuration files must be protected with appropriate file
/// permissions (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend kind: "local" (default) or "docker"
    #[serde(default, rename = "type")]
    pub kind: BackendKind,

    // === Local process fields ===
    /// Command to execute to start a worker (local only). The worker's
    /// assigned port is appended as `--port <n>`.
    pub command: Option<String>,

    /// Arguments to pass to the command (local only)
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command (local only)
    pub working_dir: Option<String>,

    // === Docker fields ===
    /// Docker image to run (required for Docker backends)
    pub image: Option<String>,

    /// Port the worker process listens on inside the container (required for
    /// Docker backends); published as `host_port:container_port`
    pub container_port: Option<u16>,

    /// Docker host URL (default: the local daemon socket)
    pub docker_host: Option<String>,

    /// Docker network to connect containers to
    pub network: Option<String>,

    /// Bind mounts in `host:container` form
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Image pull policy: "always", "missing" (default), or "never"
    #[serde(default)]
    pub pull_policy: PullPolicy,

    // === Common fields ===
    /// Environment variables to set on each worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Name prefix marking workers as owned by this controller; used for
    /// container naming and orphan reclaim (default: scalegate)
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl BackendConfig {
    /// Create a local backend config with defaults
    pub fn local(command: &str) -> Self {
        Self {
            kind: BackendKind::Local,
            command: Some(command.to_string()),
            args: Vec::new(),
            working_dir: None,
            image: None,
            container_port: None,
            docker_host: None,
            network: None,
            volumes: Vec::new(),
            pull_policy: PullPolicy::default(),
            env: HashMap::new(),
            name_prefix: default_name_prefix(),
        }
    }

    /// Create a Docker backend config with defaults
    pub fn docker(image: &str, container_port: u16) -> Self {
        Self {
            kind: BackendKind::Docker,
            command: None,
            args: Vec::new(),
            working_dir: None,
            image: Some(image.to_string()),
            container_port: Some(container_port),
            docker_host: None,
            network: None,
            volumes: Vec::new(),
            pull_policy: PullPolicy::default(),
            env: HashMap::new(),
            name_prefix: default_name_prefix(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field requirements; errors here are fatal at startup,
    /// before the listener binds.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scaling.max_instances == 0 {
            anyhow::bail!("scaling.max_instances must be at least 1");
        }
        if self.scaling.min_instances > self.scaling.max_instances {
            anyhow::bail!(
                "scaling.min_instances ({}) exceeds scaling.max_instances ({})",
                self.scaling.min_instances,
                self.scaling.max_instances
            );
        }
        match self.backend.kind {
            BackendKind::Local => {
                if self.backend.command.is_none() {
                    anyhow::bail!("backend.command is required for local backends");
                }
            }
            BackendKind::Docker => {
                if self.backend.image.is_none() {
                    anyhow::bail!("backend.image is required for docker backends");
                }
                if self.backend.container_port.is_none() {
                    anyhow::bail!("backend.container_port is required for docker backends");
                }
            }
        }
        if self.backend.name_prefix.is_empty() {
            anyhow::bail!("backend.name_prefix must not be empty");
        }
        Ok(())
    }
}

fn default_listen_port() -> u16 {
    4000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_min_instances() -> usize {
    2
}

fn default_max_instances() -> usize {
    10
}

fn default_check_interval() -> u64 {
    5000
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_scale_up_threshold() -> f64 {
    3.0
}

fn default_scale_down_threshold() -> f64 {
    0.5
}

fn default_idle_timeout() -> u64 {
    30000
}

fn default_base_port() -> u16 {
    5001
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_name_prefix() -> String {
    "scalegate".to_string()
}
