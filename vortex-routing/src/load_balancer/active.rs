//! The set of origins currently taking traffic.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::load_balancer::RemoteHost;

/// Read access to the active origins of one application.
pub trait ActiveOrigins: Send + Sync {
    /// The origins currently taking traffic.
    fn snapshot(&self) -> Arc<Vec<RemoteHost>>;
}

/// A lock-free, atomically replaced list of active origins.
///
/// Readers on the request path load the current list without locking; the
/// inventory swaps in a whole new list whenever an origin changes state.
#[derive(Debug, Default)]
pub struct ActiveOriginSet {
    hosts: ArcSwap<Vec<RemoteHost>>,
}

impl ActiveOriginSet {
    /// Create a set holding `hosts`.
    pub fn new(hosts: Vec<RemoteHost>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(hosts),
        }
    }

    /// Atomically replace the whole set.
    pub fn update(&self, hosts: Vec<RemoteHost>) {
        self.hosts.store(Arc::new(hosts));
    }

    /// Number of active origins.
    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    /// Whether no origin is active.
    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }
}

impl ActiveOrigins for ActiveOriginSet {
    fn snapshot(&self) -> Arc<Vec<RemoteHost>> {
        self.hosts.load_full()
    }
}
