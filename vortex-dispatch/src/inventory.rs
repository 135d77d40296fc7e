//! The live origin set of one backend service.
//!
//! Each origin is `Active`, `Inactive` (failing health checks) or `Disabled`
//! (switched off by an operator). Only active origins are offered to load
//! balancers, through an atomically replaced [`ActiveOriginSet`]. Every state
//! change is announced to the registered [`OriginsChangeListener`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vortex_routing::load_balancer::{
    ActiveOriginSet, ActiveOrigins, OriginsChangeListener, OriginsSnapshot, RemoteHost,
};
use vortex_routing::{Origin, OriginId};

use crate::connection_pool::ConnectionPoolFactory;
use crate::host_client::HostClient;

/// Whether an origin takes traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginState {
    /// Taking traffic.
    Active,
    /// Failing health checks.
    Inactive,
    /// Switched off by an operator.
    Disabled,
}

impl fmt::Display for OriginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Disabled => "DISABLED",
        })
    }
}

/// Handle of a registered [`OriginsChangeListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct MonitoredOrigin {
    origin: Origin,
    state: OriginState,
    client: Arc<HostClient>,
}

/// Origins of one application with their state and connection pools.
pub struct OriginsInventory {
    app_id: String,
    pool_factory: Arc<dyn ConnectionPoolFactory>,
    origins: Mutex<BTreeMap<OriginId, MonitoredOrigin>>,
    active: ActiveOriginSet,
    listeners: DashMap<ListenerId, Arc<dyn OriginsChangeListener>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl OriginsInventory {
    /// An empty inventory for `app_id`.
    pub fn new(app_id: impl Into<String>, pool_factory: Arc<dyn ConnectionPoolFactory>) -> Self {
        Self {
            app_id: app_id.into(),
            pool_factory,
            origins: Mutex::new(BTreeMap::new()),
            active: ActiveOriginSet::default(),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The application id.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Replace the origin set. Unchanged origins keep their state and pool, new
    /// ones start active, and removed ones have their pool closed.
    pub fn set_origins(&self, origins: Vec<Origin>) {
        if self.closed.load(Ordering::Acquire) {
            warn!(app = %self.app_id, "ignoring origin update on closed inventory");
            return;
        }
        {
            let mut current = self.origins.lock();
            let mut next = BTreeMap::new();
            for origin in origins {
                match current.remove(&origin.id) {
                    Some(existing) if existing.origin == origin => {
                        next.insert(origin.id.clone(), existing);
                    }
                    replaced => {
                        if let Some(old) = replaced {
                            old.client.close();
                        }
                        info!(app = %self.app_id, origin = %origin.id, "origin added");
                        let client = Arc::new(HostClient::new(self.pool_factory.create(&origin)));
                        next.insert(
                            origin.id.clone(),
                            MonitoredOrigin {
                                origin,
                                state: OriginState::Active,
                                client,
                            },
                        );
                    }
                }
            }
            for (id, removed) in std::mem::take(&mut *current) {
                info!(app = %self.app_id, origin = %id, "origin removed");
                removed.client.close();
            }
            *current = next;
            self.publish_active(&current);
        }
        self.notify_listeners();
    }

    /// Mark an origin as passing health checks.
    pub fn origin_healthy(&self, id: &OriginId) {
        self.transition(id, |state| (state == OriginState::Inactive).then_some(OriginState::Active));
    }

    /// Mark an origin as failing health checks.
    pub fn origin_unhealthy(&self, id: &OriginId) {
        self.transition(id, |state| (state == OriginState::Active).then_some(OriginState::Inactive));
    }

    /// Put a disabled origin back into rotation.
    pub fn enable_origin(&self, id: &OriginId) {
        self.transition(id, |state| (state == OriginState::Disabled).then_some(OriginState::Active));
    }

    /// Take an origin out of rotation until it is enabled again.
    pub fn disable_origin(&self, id: &OriginId) {
        self.transition(id, |state| (state != OriginState::Disabled).then_some(OriginState::Disabled));
    }

    /// State of an origin.
    pub fn origin_state(&self, id: &OriginId) -> Option<OriginState> {
        self.origins.lock().get(id).map(|monitored| monitored.state)
    }

    /// Origins grouped by state.
    pub fn origins_snapshot(&self) -> OriginsSnapshot {
        let origins = self.origins.lock();
        let mut snapshot = OriginsSnapshot {
            app_id: self.app_id.clone(),
            ..OriginsSnapshot::default()
        };
        for monitored in origins.values() {
            let bucket = match monitored.state {
                OriginState::Active => &mut snapshot.active,
                OriginState::Inactive => &mut snapshot.inactive,
                OriginState::Disabled => &mut snapshot.disabled,
            };
            bucket.push(monitored.origin.clone());
        }
        snapshot
    }

    /// Origins a health checker should probe: every origin not disabled.
    pub fn probe_targets(&self) -> Vec<Origin> {
        self.origins
            .lock()
            .values()
            .filter(|monitored| monitored.state != OriginState::Disabled)
            .map(|monitored| monitored.origin.clone())
            .collect()
    }

    /// Register a listener told about every origin change.
    pub fn add_origins_change_listener(&self, listener: Arc<dyn OriginsChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn remove_origins_change_listener(&self, id: ListenerId) {
        self.listeners.remove(&id);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Close every connection pool and drop all origins.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = std::mem::take(&mut *self.origins.lock());
        for monitored in removed.values() {
            monitored.client.close();
        }
        self.active.update(Vec::new());
        info!(app = %self.app_id, origins = removed.len(), "origins inventory closed");
        self.notify_listeners();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn transition<F>(&self, id: &OriginId, next_state: F)
    where
        F: FnOnce(OriginState) -> Option<OriginState>,
    {
        {
            let mut origins = self.origins.lock();
            let Some(monitored) = origins.get_mut(id) else {
                debug!(app = %self.app_id, origin = %id, "state change for unknown origin");
                return;
            };
            let Some(next) = next_state(monitored.state) else {
                return;
            };
            info!(
                app = %self.app_id,
                origin = %id,
                from = %monitored.state,
                to = %next,
                "origin state changed"
            );
            monitored.state = next;
            self.publish_active(&origins);
        }
        self.notify_listeners();
    }

    fn publish_active(&self, origins: &BTreeMap<OriginId, MonitoredOrigin>) {
        let hosts = origins
            .values()
            .filter(|monitored| monitored.state == OriginState::Active)
            .map(|monitored| RemoteHost::new(monitored.origin.clone(), Arc::clone(&monitored.client)))
            .collect();
        self.active.update(hosts);
    }

    fn notify_listeners(&self) {
        let snapshot = self.origins_snapshot();
        let listeners: Vec<Arc<dyn OriginsChangeListener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener.origins_changed(&snapshot);
        }
    }
}

impl ActiveOrigins for OriginsInventory {
    fn snapshot(&self) -> Arc<Vec<RemoteHost>> {
        self.active.snapshot()
    }
}

impl fmt::Debug for OriginsInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginsInventory")
            .field("app_id", &self.app_id)
            .field("active", &self.active.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
