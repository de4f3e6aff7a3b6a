//! Docker-container worker runtime
//!
//! Containers are named `<prefix>-<short id>` so a later controller lifetime
//! can find and reclaim anything this one leaves behind.

use crate::config::{BackendConfig, PullPolicy};
use crate::runtime::RuntimeState;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace window passed to `docker stop` before the daemon kills the container
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct DockerRuntime {
    client: Docker,
    image: String,
    container_port: u16,
    env: HashMap<String, String>,
    volumes: Vec<String>,
    network: Option<String>,
    name_prefix: String,
    pull_policy: PullPolicy,
}

/// Handle to a running worker container
#[derive(Debug)]
pub struct ContainerHandle {
    pub id: String,
}

impl ContainerHandle {
    /// Short container id, the runtime-native identifier shown in status
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

impl DockerRuntime {
    pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let image = config
            .image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("docker backend requires 'image'"))?;
        let container_port = config
            .container_port
            .ok_or_else(|| anyhow::anyhow!("docker backend requires 'container_port'"))?;

        let client = connect(config.docker_host.as_deref())?;

        // Verify connection before committing to this backend
        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure dockerd is running or set DOCKER_HOST.",
                e
            )
        })?;
        debug!("Connected to Docker daemon");

        Ok(Self {
            client,
            image,
            container_port,
            env: config.env.clone(),
            volumes: config.volumes.clone(),
            network: config.network.clone(),
            name_prefix: config.name_prefix.clone(),
            pull_policy: config.pull_policy,
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Pull the worker image according to the configured policy.
    ///
    /// `always`: a failed pull is fatal. `missing`: pull when absent locally,
    /// log and continue on failure. `never`: skip entirely.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        match self.pull_policy {
            PullPolicy::Always => self.pull_image().await,
            PullPolicy::Missing => {
                if self.client.inspect_image(&self.image).await.is_ok() {
                    debug!(image = %self.image, "Image exists locally, skipping pull");
                    return Ok(());
                }
                if let Err(e) = self.pull_image().await {
                    warn!(image = %self.image, error = %e, "Image pull failed, continuing");
                }
                Ok(())
            }
            PullPolicy::Never => {
                debug!(image = %self.image, "Pull policy is 'never', skipping pull");
                Ok(())
            }
        }
    }

    async fn pull_image(&self) -> anyhow::Result<()> {
        info!(image = %self.image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image = %self.image, status, "Pull progress");
                    }
                    if let Some(error) = progress.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        anyhow::bail!(
                            "Image '{}' not found in registry. \
                             Check the image name and tag are correct.",
                            self.image
                        );
                    }
                    anyhow::bail!("Failed to pull image '{}': {}", self.image, e);
                }
            }
        }

        if let Some(error) = last_error {
            anyhow::bail!("Failed to pull image '{}': {}", self.image, error);
        }

        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    /// Create and start a worker container publishing
    /// `127.0.0.1:<host_port> -> <container_port>`
    pub async fn create(&self, name: &str, host_port: u16) -> anyhow::Result<ContainerHandle> {
        let port_key = format!("{}/tcp", self.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: binds(&self.volumes),
            network_mode: self.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.image.clone()),
            env: Some(container_env(&self.env, self.container_port)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    anyhow::anyhow!(
                        "Port {} is already in use by another container or process",
                        host_port
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        name,
                        self.image,
                        e
                    )
                }
            })?;

        let container_id = response.id;
        debug!(name, container_id, image = %self.image, "Created worker container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                anyhow::anyhow!("Failed to start container '{}' (id: {}): {}", name, container_id, e)
            })?;

        info!(name, container_id, host_port, "Started worker container");
        Ok(ContainerHandle { id: container_id })
    }

    /// Stop the container gracefully, then remove it. Idempotent: a missing
    /// or already-stopped container is not an error.
    pub async fn terminate(&self, handle: ContainerHandle) -> anyhow::Result<()> {
        self.stop_container(&handle.id).await?;
        self.remove_container(&handle.id).await
    }

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: STOP_GRACE.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped worker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force-remove a container by id or name
    pub async fn remove_container(&self, container: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => {
                debug!(container, "Removed worker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container, error = %e, "Failed to remove container");
                Ok(())
            }
        }
    }

    /// Map the daemon's container state onto the four-value summary
    pub async fn state_by_id(&self, container_id: &str) -> RuntimeState {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => {
                let status = info.state.and_then(|s| s.status);
                map_container_state(status)
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => RuntimeState::NotFound,
            Err(e) => {
                debug!(container_id, error = %e, "Container inspect failed");
                RuntimeState::NotFound
            }
        }
    }

    /// Names of containers carrying this controller's ownership prefix,
    /// including stopped ones. Used once at startup for orphan reclaim.
    pub async fn list_owned(&self) -> anyhow::Result<Vec<String>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("name".to_string(), vec![self.name_prefix.clone()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        let marker = format!("{}-", self.name_prefix);
        let mut names = Vec::new();
        for container in containers {
            for name in container.names.unwrap_or_default() {
                // Docker reports names with a leading slash; the filter is a
                // substring match, so re-check the prefix exactly.
                let name = name.trim_start_matches('/');
                if name.starts_with(&marker) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

fn connect(docker_host: Option<&str>) -> anyhow::Result<Docker> {
    let host = docker_host
        .map(String::from)
        .or_else(|| std::env::var("DOCKER_HOST").ok());

    match host {
        Some(host) if host.starts_with("unix://") => {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        }
        Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        }
        Some(host) => anyhow::bail!(
            "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        ),
        None => Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd or set DOCKER_HOST.",
                e
            )
        }),
    }
}

/// Worker environment: user variables plus the port the process must bind
fn container_env(env: &HashMap<String, String>, container_port: u16) -> Vec<String> {
    let mut vars: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    vars.sort();
    vars.push(format!("PORT={}", container_port));
    vars
}

fn binds(volumes: &[String]) -> Option<Vec<String>> {
    if volumes.is_empty() {
        None
    } else {
        Some(volumes.to_vec())
    }
}

fn map_container_state(status: Option<ContainerStateStatusEnum>) -> RuntimeState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => {
            RuntimeState::Starting
        }
        // A paused container is still an extant runtime entity
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::PAUSED) => {
            RuntimeState::Running
        }
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::REMOVING) => RuntimeState::Exited,
        _ => RuntimeState::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_env_includes_port() {
        let mut env = HashMap::new();
        env.insert("RUST_LOG".to_string(), "info".to_string());
        env.insert("APP_MODE".to_string(), "worker".to_string());

        let vars = container_env(&env, 3000);
        assert_eq!(
            vars,
            vec![
                "APP_MODE=worker".to_string(),
                "RUST_LOG=info".to_string(),
                "PORT=3000".to_string(),
            ]
        );
    }

    #[test]
    fn test_binds_empty_is_none() {
        assert_eq!(binds(&[]), None);
        assert_eq!(
            binds(&["/srv:/data".to_string()]),
            Some(vec!["/srv:/data".to_string()])
        );
    }

    #[test]
    fn test_container_state_mapping() {
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::CREATED)),
            RuntimeState::Starting
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RESTARTING)),
            RuntimeState::Starting
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RUNNING)),
            RuntimeState::Running
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::PAUSED)),
            RuntimeState::Running
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::EXITED)),
            RuntimeState::Exited
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::DEAD)),
            RuntimeState::Exited
        );
        assert_eq!(map_container_state(None), RuntimeState::NotFound);
    }

    #[test]
    fn test_short_id_truncates() {
        let handle = ContainerHandle {
            id: "0123456789abcdef0123456789abcdef".to_string(),
        };
        assert_eq!(handle.short_id(), "0123456789ab");

        let short = ContainerHandle {
            id: "abc".to_string(),
        };
        assert_eq!(short.short_id(), "abc");
    }

    #[test]
    fn test_invalid_docker_host_rejected() {
        let err = connect(Some("ftp://example.com")).unwrap_err();
        assert!(err.to_string().contains("Invalid docker host"));
    }
}
