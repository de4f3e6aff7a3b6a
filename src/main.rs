use scalegate::config::Config;
use scalegate::controller::Controller;
use scalegate::proxy::{ProxyServer, UpstreamConfig};
use scalegate::runtime::Runtime;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Version information for the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Upper bound on worker terminations during graceful shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; missing required fields are fatal here, before
    // anything binds or spawns
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("scalegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bring up the worker runtime backend
    let runtime = Runtime::from_config(&config.backend).await?;

    let upstream_config = UpstreamConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create the controller and reclaim, prepare, and warm up the pool
    let controller = Controller::new(config, runtime, shutdown_rx.clone());
    controller.initialize().await?;
    controller.start_background_tasks();

    // Bind failure is fatal; bind before spawning the accept loop
    let proxy = ProxyServer::bind(
        bind_addr,
        Arc::clone(&controller),
        upstream_config,
        shutdown_rx.clone(),
    )
    .await?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop timers and the accept loop, then terminate the pool
    let _ = shutdown_tx.send(true);
    controller.shutdown(SHUTDOWN_DEADLINE).await;

    // Wait for the listener to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), proxy_handle)
        .await
        .is_err()
    {
        warn!("Proxy server did not stop within 5s");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting pool controller");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Listener configuration"
    );
    info!(
        min_instances = config.scaling.min_instances,
        max_instances = config.scaling.max_instances,
        check_interval_ms = config.scaling.check_interval_ms,
        scale_up_threshold = config.scaling.scale_up_threshold,
        scale_down_threshold = config.scaling.scale_down_threshold,
        idle_timeout_ms = config.scaling.idle_timeout_ms,
        base_port = config.scaling.base_port,
        "Scaling configuration"
    );
    info!(
        backend = ?config.backend.kind,
        health_endpoint = %config.scaling.health_endpoint,
        health_timeout_ms = config.scaling.health_timeout_ms,
        name_prefix = %config.backend.name_prefix,
        "Backend configuration"
    );
}
