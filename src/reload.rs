//! Live configuration reload.
//!
//! Polls the config file's modification time and applies backend list
//! changes to the running pool. An update that fails to parse or
//! validate is discarded; the pool keeps serving the old snapshot.
//! Listener settings cannot change without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{self, LoadBalancerOptions};
use crate::proxy::{BackendPool, PassiveHealthMonitor};

pub struct ReloadContext {
    pub config_path: PathBuf,
    pub poll_interval: Duration,
    pub active_options: LoadBalancerOptions,
    pub pool: Arc<BackendPool>,
    pub monitor: Arc<PassiveHealthMonitor>,
}

/// Watch the config file until shutdown, applying backend updates.
pub async fn run_reload_loop(
    ctx: ReloadContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut last_modified = modified_at(&ctx.config_path).await;
    let mut current_backends = ctx.active_options.backends.clone();

    info!(
        config_path = %ctx.config_path.display(),
        poll_interval_ms = ctx.poll_interval.as_millis() as u64,
        "Watching configuration for backend updates"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            _ = shutdown.changed() => break,
        }

        let modified = modified_at(&ctx.config_path).await;
        if modified == last_modified {
            continue;
        }
        last_modified = modified;

        let options = match config::load_from_file(&ctx.config_path) {
            Ok(options) => options,
            Err(e) => {
                warn!(
                    config_path = %ctx.config_path.display(),
                    error = %e,
                    "Ignoring invalid configuration update"
                );
                continue;
            }
        };

        if options.listen_address != ctx.active_options.listen_address
            || options.listen_port != ctx.active_options.listen_port
        {
            warn!(
                listen_address = %options.listen_address,
                listen_port = options.listen_port,
                "Listener settings changed; a restart is required to apply them"
            );
        }

        if options.backends == current_backends {
            debug!("Configuration changed without backend updates");
            continue;
        }

        match ctx.pool.update_backends(&options.backends) {
            Ok(()) => {
                let live: Vec<_> = ctx.pool.snapshot().iter().map(|b| b.id()).collect();
                ctx.monitor.retain(&live);
                current_backends = options.backends;
                info!(
                    backend_count = current_backends.len(),
                    "Backend list reloaded"
                );
            }
            Err(e) => {
                warn!(error = %e, "Backend update rejected, keeping previous snapshot");
            }
        }
    }

    debug!("Configuration watcher stopped");
    Ok(())
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}
