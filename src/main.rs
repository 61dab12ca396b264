//! tcplb
//!
//! Layer-4 TCP load balancer.
//!
//! This service:
//! - Accepts client TCP connections on a configured endpoint
//! - Selects a backend per connection with round-robin
//! - Forwards bytes bidirectionally with half-close propagation
//! - Monitors backend health passively from connection outcomes
//! - Reloads the backend list when the config file changes

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcplb::config::{self, ProcessEnv};
use tcplb::proxy::{BackendPool, PassiveHealthMonitor, ProxyConfig, RoundRobinSelector, TcpProxy};
use tcplb::reload::{self, ReloadContext};

#[tokio::main]
async fn main() -> Result<()> {
    let env = ProcessEnv::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TCPLB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| env.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tcplb");

    let options = config::load_from_file(&env.config_path)
        .with_context(|| format!("loading {}", env.config_path.display()))?;
    info!(
        listen_address = %options.listen_address,
        listen_port = options.listen_port,
        backend_count = options.backends.len(),
        failure_threshold = options.health.passive_monitoring.failure_threshold,
        success_threshold = options.health.passive_monitoring.success_threshold,
        "Configuration loaded"
    );
    for backend in &options.backends {
        info!(
            backend = %backend.name,
            address = %backend.address,
            port = backend.port,
            weight = backend.weight,
            "Backend configured"
        );
    }

    let pool = Arc::new(BackendPool::new(&options.backends)?);
    let monitor = Arc::new(PassiveHealthMonitor::new(
        &options.health.passive_monitoring,
    ));
    let selector = Arc::new(RoundRobinSelector::new(Arc::clone(&pool)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = Arc::new(
        TcpProxy::bind(
            ProxyConfig::from_options(&options)?,
            selector,
            Arc::clone(&monitor),
            shutdown_rx.clone(),
        )
        .await
        .context("binding listener")?,
    );

    let accept_task = tokio::spawn(Arc::clone(&proxy).run());
    let reload_task = tokio::spawn(reload::run_reload_loop(
        ReloadContext {
            config_path: env.config_path.clone(),
            poll_interval: env.reload_poll_interval,
            active_options: options,
            pool,
            monitor,
        },
        shutdown_rx,
    ));

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    accept_task.await.context("accept loop panicked")??;
    reload_task.await.context("config watcher panicked")??;

    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    }

    Ok(())
}
