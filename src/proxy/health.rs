//! Passive health monitoring.
//!
//! Connection handlers report per-session outcomes here. The monitor
//! keeps consecutive success/failure counters per backend and flips the
//! backend health flag when a threshold is crossed:
//!
//! ```text
//! Healthy   -> Unhealthy: consecutive failures  >= failure_threshold
//! Unhealthy -> Healthy:   consecutive successes >= success_threshold
//! ```
//!
//! Counters are not zeroed on a transition; the first event of the
//! opposite kind resets them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::backend::{Backend, BackendId};
use crate::config::PassiveMonitoringOptions;

/// Consecutive failure/success counters for one backend.
///
/// Both counters live in one atomic word (failures in the high half,
/// successes in the low half), so an event of one kind increments its
/// counter and zeroes the other in a single store, and readers always
/// observe a consistent pair. At most one counter is non-zero after any
/// recorded event.
#[derive(Debug, Default)]
pub struct ErrorWindow {
    counters: AtomicU64,
}

const FAILURES_SHIFT: u32 = 32;

impl ErrorWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure: failures + 1, successes reset to zero.
    pub fn record_error(&self) {
        let mut current = self.counters.load(Ordering::Acquire);
        loop {
            let failures = (current >> FAILURES_SHIFT) as u32;
            let next = u64::from(failures.saturating_add(1)) << FAILURES_SHIFT;
            match self.counters.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a success: successes + 1, failures reset to zero.
    pub fn record_success(&self) {
        let mut current = self.counters.load(Ordering::Acquire);
        loop {
            let successes = current as u32;
            let next = u64::from(successes.saturating_add(1));
            match self.counters.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        (self.counters.load(Ordering::Acquire) >> FAILURES_SHIFT) as u32
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.counters.load(Ordering::Acquire) as u32
    }
}

/// Observes per-connection outcomes and drives backend health transitions.
pub struct PassiveHealthMonitor {
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    windows: RwLock<HashMap<BackendId, Arc<ErrorWindow>>>,
}

impl PassiveHealthMonitor {
    pub fn new(options: &PassiveMonitoringOptions) -> Self {
        Self {
            enabled: options.enabled,
            failure_threshold: options.failure_threshold,
            success_threshold: options.success_threshold,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Record a failed connection outcome for a backend.
    pub fn record_failure(&self, backend: &Backend) {
        let window = self.window_for(backend);
        window.record_error();
        let failures = window.consecutive_failures();

        if self.enabled
            && failures >= self.failure_threshold
            && backend.health().is_healthy()
        {
            backend.health().mark_unhealthy();
            warn!(
                backend = %backend.name,
                address = %backend.address,
                port = backend.port,
                consecutive_failures = failures,
                "Backend marked unhealthy"
            );
        } else {
            debug!(
                backend = %backend.name,
                consecutive_failures = failures,
                failure_threshold = self.failure_threshold,
                "Backend failure recorded"
            );
        }
    }

    /// Record a successful connection outcome for a backend.
    pub fn record_success(&self, backend: &Backend) {
        let window = self.window_for(backend);
        window.record_success();
        let successes = window.consecutive_successes();

        if self.enabled
            && successes >= self.success_threshold
            && !backend.health().is_healthy()
        {
            backend.health().mark_healthy();
            info!(
                backend = %backend.name,
                address = %backend.address,
                port = backend.port,
                consecutive_successes = successes,
                "Backend recovered, marked healthy"
            );
        } else {
            debug!(
                backend = %backend.name,
                consecutive_successes = successes,
                success_threshold = self.success_threshold,
                "Backend success recorded"
            );
        }
    }

    /// Consecutive failure count for a backend, zero if never observed.
    pub fn consecutive_failures(&self, backend: &Backend) -> u32 {
        self.windows
            .read()
            .unwrap()
            .get(&backend.id())
            .map(|w| w.consecutive_failures())
            .unwrap_or(0)
    }

    /// Consecutive success count for a backend, zero if never observed.
    pub fn consecutive_successes(&self, backend: &Backend) -> u32 {
        self.windows
            .read()
            .unwrap()
            .get(&backend.id())
            .map(|w| w.consecutive_successes())
            .unwrap_or(0)
    }

    /// Drop windows for backends no longer in the pool.
    pub fn retain(&self, live: &[BackendId]) {
        self.windows
            .write()
            .unwrap()
            .retain(|id, _| live.contains(id));
    }

    fn window_for(&self, backend: &Backend) -> Arc<ErrorWindow> {
        let id = backend.id();

        if let Some(window) = self.windows.read().unwrap().get(&id) {
            return Arc::clone(window);
        }

        let mut windows = self.windows.write().unwrap();
        Arc::clone(windows.entry(id).or_default())
    }
}
