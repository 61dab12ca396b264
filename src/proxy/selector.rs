//! Round-robin backend selection.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::backend::{Backend, BackendPool};

/// Selects the next healthy backend in round-robin order.
///
/// Selection is lock-free: one snapshot load plus one fetch-and-add on a
/// signed 32-bit counter. The counter starts at -1 so the first selection
/// lands on index 0; the sign bit is masked off before the modulo, which
/// makes wraparound benign. Fairness is best-effort while the pool is
/// being mutated.
pub struct RoundRobinSelector {
    pool: Arc<BackendPool>,
    counter: AtomicI32,
}

impl RoundRobinSelector {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            counter: AtomicI32::new(-1),
        }
    }

    /// The next healthy backend, or `None` when no backend is healthy.
    ///
    /// Ties break in snapshot order, i.e. the order the backends were
    /// configured in.
    pub fn select_backend(&self) -> Option<Arc<Backend>> {
        let healthy = self.pool.healthy_backends();
        if healthy.is_empty() {
            return None;
        }

        let ticket = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let index = (ticket & 0x7FFF_FFFF) as usize % healthy.len();

        let backend = Arc::clone(&healthy[index]);
        debug!(
            backend = %backend.name,
            index,
            healthy_count = healthy.len(),
            "Backend selected"
        );
        Some(backend)
    }
}
