//! Backend identity, health flag, and pool snapshots.
//!
//! The pool publishes an immutable backend list behind an atomic pointer
//! swap. Readers load the current snapshot without blocking; updates
//! replace it wholesale. Backends whose identity survives an update keep
//! their shared handle, so health state persists across reloads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::debug;

use crate::config::BackendOptions;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool must always hold at least one backend.
    #[error("backend list must not be empty")]
    EmptyBackends,
}

/// Stable identity of a backend within the pool.
///
/// The full configured tuple, weight included: state keyed by this id
/// lives exactly as long as the pool considers the backend unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// Atomically readable healthy/unhealthy flag.
///
/// Transitions are single stores; readers observe either the pre- or the
/// post-state, never a torn value. Marking an already-healthy backend
/// healthy (or the reverse) is a no-op.
#[derive(Debug)]
pub struct BackendHealth {
    healthy: AtomicBool,
}

impl BackendHealth {
    /// New flag, initialised healthy.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend endpoint the proxy may forward traffic to.
#[derive(Debug)]
pub struct Backend {
    /// Display name.
    pub name: String,
    /// Host or IP.
    pub address: String,
    /// Port.
    pub port: u16,
    /// Reserved for weighted selection policies.
    pub weight: u32,
    health: BackendHealth,
}

impl Backend {
    pub fn new(options: &BackendOptions) -> Self {
        Self {
            name: options.name.clone(),
            address: options.address.clone(),
            port: options.port,
            weight: options.weight,
            health: BackendHealth::new(),
        }
    }

    /// The backend's health flag.
    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    /// Stable identity for state keyed outside the pool.
    pub fn id(&self) -> BackendId {
        BackendId {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            weight: self.weight,
        }
    }

    fn matches(&self, options: &BackendOptions) -> bool {
        self.name == options.name
            && self.address == options.address
            && self.port == options.port
            && self.weight == options.weight
    }
}

/// Owns the current backend list and publishes immutable snapshots.
pub struct BackendPool {
    snapshot: ArcSwap<Vec<Arc<Backend>>>,
}

impl BackendPool {
    /// Create a pool from the configured backend list.
    pub fn new(backends: &[BackendOptions]) -> Result<Self, PoolError> {
        if backends.is_empty() {
            return Err(PoolError::EmptyBackends);
        }

        let initial: Vec<Arc<Backend>> =
            backends.iter().map(|b| Arc::new(Backend::new(b))).collect();

        Ok(Self {
            snapshot: ArcSwap::from_pointee(initial),
        })
    }

    /// The full current snapshot, healthy or not.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        self.snapshot.load_full()
    }

    /// The subsequence of the current snapshot that is healthy right now.
    ///
    /// The returned list is stable: concurrent updates and health
    /// transitions do not affect it. A later call may differ.
    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.snapshot
            .load()
            .iter()
            .filter(|b| b.health().is_healthy())
            .cloned()
            .collect()
    }

    /// Atomically replace the backend list.
    ///
    /// Backends whose identity tuple is unchanged keep their existing
    /// handle, preserving health state; new or changed entries start
    /// healthy. Readers observe either the old list in full or the new
    /// list in full.
    pub fn update_backends(&self, backends: &[BackendOptions]) -> Result<(), PoolError> {
        if backends.is_empty() {
            return Err(PoolError::EmptyBackends);
        }

        let current = self.snapshot.load();
        let next: Vec<Arc<Backend>> = backends
            .iter()
            .map(|options| {
                current
                    .iter()
                    .find(|existing| existing.matches(options))
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Backend::new(options)))
            })
            .collect();

        let backend_count = next.len();
        self.snapshot.store(Arc::new(next));

        debug!(backend_count, "Backend pool updated");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Number of currently healthy backends.
    pub fn healthy_count(&self) -> usize {
        self.snapshot
            .load()
            .iter()
            .filter(|b| b.health().is_healthy())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(name: &str, port: u16) -> BackendOptions {
        BackendOptions {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            weight: 1,
        }
    }

    #[test]
    fn test_health_flag_transitions() {
        let health = BackendHealth::new();
        assert!(health.is_healthy());

        health.mark_unhealthy();
        assert!(!health.is_healthy());

        // Idempotent
        health.mark_unhealthy();
        assert!(!health.is_healthy());

        health.mark_healthy();
        assert!(health.is_healthy());
        health.mark_healthy();
        assert!(health.is_healthy());
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(BackendPool::new(&[]), Err(PoolError::EmptyBackends)));
    }

    #[test]
    fn test_healthy_backends_filters_snapshot() {
        let pool = BackendPool::new(&[options("Backend-1", 9001), options("Backend-2", 9002)])
            .unwrap();

        assert_eq!(pool.healthy_count(), 2);

        let snapshot = pool.snapshot();
        snapshot[0].health().mark_unhealthy();

        let healthy = pool.healthy_backends();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "Backend-2");
    }

    #[test]
    fn test_update_preserves_surviving_backend_state() {
        let pool = BackendPool::new(&[options("Backend-1", 9001), options("Backend-2", 9002)])
            .unwrap();

        let original = Arc::clone(&pool.snapshot()[0]);
        original.health().mark_unhealthy();

        // Backend-1 survives, Backend-2 is replaced by Backend-3.
        pool.update_backends(&[options("Backend-1", 9001), options("Backend-3", 9003)])
            .unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(Arc::ptr_eq(&snapshot[0], &original));
        assert!(!snapshot[0].health().is_healthy());
        assert_eq!(snapshot[1].name, "Backend-3");
        assert!(snapshot[1].health().is_healthy());
    }

    #[test]
    fn test_update_with_empty_list_keeps_old_snapshot() {
        let pool = BackendPool::new(&[options("Backend-1", 9001)]).unwrap();

        assert!(matches!(
            pool.update_backends(&[]),
            Err(PoolError::EmptyBackends)
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_changed_identity_resets_health() {
        let pool = BackendPool::new(&[options("Backend-1", 9001)]).unwrap();
        pool.snapshot()[0].health().mark_unhealthy();

        // Same name, different port: a new backend.
        pool.update_backends(&[options("Backend-1", 9005)]).unwrap();
        assert!(pool.snapshot()[0].health().is_healthy());
    }

    #[test]
    fn test_weight_change_is_a_new_identity() {
        let pool = BackendPool::new(&[options("Backend-1", 9001)]).unwrap();
        let original = Arc::clone(&pool.snapshot()[0]);
        original.health().mark_unhealthy();

        let mut reweighted = options("Backend-1", 9001);
        reweighted.weight = 2;
        pool.update_backends(&[reweighted]).unwrap();

        // The pool replaces the backend, and its id changes with it.
        let snapshot = pool.snapshot();
        assert!(!Arc::ptr_eq(&snapshot[0], &original));
        assert!(snapshot[0].health().is_healthy());
        assert_ne!(snapshot[0].id(), original.id());
    }
}
