//! TCP proxy: accept loop and per-connection handling.
//!
//! Each accepted connection is handled on its own task: select a healthy
//! backend, dial it with a timeout, forward bidirectionally, and report
//! the outcome to the passive health monitor. Errors never escape a
//! handler; the accept loop logs its own errors and keeps running until
//! shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::backend::Backend;
use super::forward::{forward, ForwardOutcome};
use super::health::PassiveHealthMonitor;
use super::selector::RoundRobinSelector;
use crate::config::{ConfigError, LoadBalancerOptions};

/// Proxy settings consumed by the listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind to.
    pub listen_addr: SocketAddr,
    /// Backend dial deadline.
    pub connect_timeout: Duration,
    /// Per-read idle deadline, if any.
    pub idle_timeout: Option<Duration>,
    /// Concurrent session cap enforced at accept time.
    pub max_connections: usize,
}

impl ProxyConfig {
    pub fn from_options(options: &LoadBalancerOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: options.listen_socket_addr()?,
            connect_timeout: options.connect_timeout(),
            idle_timeout: options.idle_timeout(),
            max_connections: options.connection.max_concurrent_connections,
        })
    }
}

/// Counters for a running proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections dropped because no backend was healthy.
    pub no_healthy_backend: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Sessions that ended with a forwarding fault.
    pub forward_faulted: AtomicU64,
    /// Bytes forwarded client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes forwarded backend to client.
    pub bytes_to_client: AtomicU64,
}

/// The TCP proxy.
pub struct TcpProxy {
    config: ProxyConfig,
    listener: TcpListener,
    selector: Arc<RoundRobinSelector>,
    monitor: Arc<PassiveHealthMonitor>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
    shutdown: watch::Receiver<bool>,
}

impl TcpProxy {
    /// Bind the listening socket.
    pub async fn bind(
        config: ProxyConfig,
        selector: Arc<RoundRobinSelector>,
        monitor: Arc<PassiveHealthMonitor>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            selector,
            monitor,
            stats: Arc::new(ProxyStats::default()),
            shutdown,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Proxy counters.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop until shutdown.
    ///
    /// Handlers are spawned and not awaited; in-flight sessions observe
    /// the shutdown signal through their own receiver clone.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Proxy started");

        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Suspend on the permit first: accepting stays paused while
            // the session cap is reached.
            let permit = tokio::select! {
                permit = Arc::clone(&self.conn_semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let (stream, peer_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid a tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let proxy = Arc::clone(&self);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                async move {
                    proxy.handle_connection(stream, peer_addr).await;
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }

        info!(bind_addr = %local_addr, "Proxy stopped");
        Ok(())
    }

    /// Handle one accepted connection end to end.
    ///
    /// Both sockets are closed on return. Only outcomes attributable to
    /// the backend are reported to the monitor: a dropped client with no
    /// healthy backend available records nothing.
    async fn handle_connection(&self, mut client: TcpStream, peer_addr: SocketAddr) {
        let backend = match self.selector.select_backend() {
            Some(backend) => backend,
            None => {
                warn!(peer = %peer_addr, "No healthy backends available, dropping connection");
                self.stats.no_healthy_backend.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        debug!(
            peer = %peer_addr,
            backend = %backend.name,
            address = %backend.address,
            port = backend.port,
            "Handling connection"
        );

        let mut shutdown = self.shutdown.clone();

        let mut upstream = match self.dial(&backend, &mut shutdown).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                error!(
                    backend = %backend.name,
                    address = %backend.address,
                    port = backend.port,
                    error = %e,
                    "Backend connect failed"
                );
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                self.monitor.record_failure(&backend);
                return;
            }
        };

        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = client.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client socket");
        }
        if let Err(e) = upstream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on backend socket");
        }

        match forward(
            &mut client,
            &mut upstream,
            self.config.idle_timeout,
            &mut shutdown,
        )
        .await
        {
            Ok(ForwardOutcome::Completed {
                bytes_to_backend,
                bytes_to_client,
            }) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_to_client
                    .fetch_add(bytes_to_client, Ordering::Relaxed);
                self.monitor.record_success(&backend);
                debug!(
                    backend = %backend.name,
                    bytes_to_backend,
                    bytes_to_client,
                    "Session completed"
                );
            }
            Ok(ForwardOutcome::Cancelled) => {
                debug!(backend = %backend.name, "Session cancelled by shutdown");
            }
            Err(e) => {
                error!(
                    backend = %backend.name,
                    address = %backend.address,
                    port = backend.port,
                    error = %e,
                    "Forwarding fault"
                );
                self.stats.forward_faulted.fetch_add(1, Ordering::Relaxed);
                self.monitor.record_failure(&backend);
            }
        }
    }

    /// Dial the backend with the configured timeout.
    ///
    /// `Ok(None)` means shutdown interrupted the dial; nothing is
    /// recorded against the backend in that case.
    async fn dial(
        &self,
        backend: &Backend,
        shutdown: &mut watch::Receiver<bool>,
    ) -> io::Result<Option<TcpStream>> {
        let connect = TcpStream::connect((backend.address.as_str(), backend.port));

        tokio::select! {
            attempt = tokio::time::timeout(self.config.connect_timeout, connect) => match attempt {
                Ok(Ok(stream)) => Ok(Some(stream)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            _ = shutdown.changed() => Ok(None),
        }
    }
}
