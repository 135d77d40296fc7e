//! Round-robin origin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::load_balancer::{ActiveOrigins, LoadBalancer, OriginsSnapshot, Preferences, RemoteHost};

/// Cycles through the active origins in order.
pub struct RoundRobinStrategy {
    active: Arc<dyn ActiveOrigins>,
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Balance over `active`.
    pub fn new(active: Arc<dyn ActiveOrigins>) -> Self {
        Self {
            active,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinStrategy {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        let hosts = self.active.snapshot();
        let candidates = preferences.candidates(&hosts);
        if candidates.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    fn origins_changed(&self, snapshot: &OriginsSnapshot) {
        debug!(app = %snapshot.app_id, active = snapshot.active.len(), "restarting round robin");
        self.cursor.store(0, Ordering::Relaxed);
    }
}
