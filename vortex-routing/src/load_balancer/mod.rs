//! Origin selection.
//!
//! A [`LoadBalancer`] picks one [`RemoteHost`] out of the set of active origins it
//! reads through [`ActiveOrigins`]. Strategies are plain (`busy`, `round_robin`,
//! `power_of_two`) or decorate another strategy (`sticky`, `restriction`); the
//! [`DecoratedLoadBalancer`] enum is the closed set of compositions a dispatch chain
//! can use.

use std::fmt;
use std::sync::Arc;

use crate::domain::origin::{Origin, OriginId};
use crate::routing::object::HttpHandler;

pub mod active;
pub mod busy;
pub mod decorated;
pub mod power_of_two;
pub mod restriction;
pub mod round_robin;
pub mod sticky;
pub mod strategy;

pub use active::{ActiveOriginSet, ActiveOrigins};
pub use busy::BusyConnectionsStrategy;
pub use decorated::DecoratedLoadBalancer;
pub use power_of_two::PowerOfTwoStrategy;
pub use restriction::OriginRestrictionStrategy;
pub use round_robin::RoundRobinStrategy;
pub use sticky::StickySessionStrategy;
pub use strategy::{LoadBalancerFactory, StrategyRegistry};

/// Load figures a strategy ranks origins by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadBalancingMetric {
    ongoing_activities: usize,
}

impl LoadBalancingMetric {
    /// A metric with the given number of ongoing activities.
    pub fn new(ongoing_activities: usize) -> Self {
        Self { ongoing_activities }
    }

    /// Requests or connections currently in progress.
    pub fn ongoing_activities(&self) -> usize {
        self.ongoing_activities
    }
}

/// Source of a live [`LoadBalancingMetric`].
pub trait LoadBalancingMetricSupplier: Send + Sync {
    /// Current load.
    fn metric(&self) -> LoadBalancingMetric;
}

/// An origin a request can be sent to, with its handler and load metric.
#[derive(Clone)]
pub struct RemoteHost {
    origin: Origin,
    handler: Arc<dyn HttpHandler>,
    metric: Arc<dyn LoadBalancingMetricSupplier>,
}

impl RemoteHost {
    /// Pair an origin with the object that both serves and measures it.
    pub fn new<H>(origin: Origin, host: Arc<H>) -> Self
    where
        H: HttpHandler + LoadBalancingMetricSupplier + 'static,
    {
        Self {
            origin,
            handler: host.clone(),
            metric: host,
        }
    }

    /// Pair an origin with separate handler and metric sources.
    pub fn from_parts(
        origin: Origin,
        handler: Arc<dyn HttpHandler>,
        metric: Arc<dyn LoadBalancingMetricSupplier>,
    ) -> Self {
        Self {
            origin,
            handler,
            metric,
        }
    }

    /// The origin.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Shorthand for `origin().id`.
    pub fn id(&self) -> &OriginId {
        &self.origin.id
    }

    /// Handler sending requests to the origin.
    pub fn handler(&self) -> &Arc<dyn HttpHandler> {
        &self.handler
    }

    /// Current load of the origin.
    pub fn metric(&self) -> LoadBalancingMetric {
        self.metric.metric()
    }
}

impl PartialEq for RemoteHost {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
    }
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("origin", &self.origin)
            .field("metric", &self.metric())
            .finish()
    }
}

/// Per-request hints for origin selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    /// Origin id (sticky sessions) or comma-separated id patterns (origin
    /// restriction) the client asked for.
    pub preferred_origins: Option<String>,
    /// Origins already tried for this request.
    pub avoid_origins: Vec<OriginId>,
}

impl Preferences {
    /// Preferences carrying the given client preference.
    pub fn preferring(preferred_origins: Option<String>) -> Self {
        Self {
            preferred_origins,
            avoid_origins: Vec::new(),
        }
    }

    /// Same preferences, additionally avoiding `origins`.
    pub fn avoiding(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        self.avoid_origins.extend(origins);
        self
    }

    /// Whether `origin` was already tried.
    pub fn avoids(&self, origin: &OriginId) -> bool {
        self.avoid_origins.contains(origin)
    }

    /// The hosts not yet tried, or all of them when every host was tried.
    pub fn candidates<'a>(&self, hosts: &'a [RemoteHost]) -> Vec<&'a RemoteHost> {
        let fresh: Vec<&RemoteHost> = hosts.iter().filter(|h| !self.avoids(h.id())).collect();
        if fresh.is_empty() {
            hosts.iter().collect()
        } else {
            fresh
        }
    }
}

/// Origin set of one application, grouped by state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginsSnapshot {
    /// Application the origins belong to.
    pub app_id: String,
    /// Origins taking traffic.
    pub active: Vec<Origin>,
    /// Origins failing health checks.
    pub inactive: Vec<Origin>,
    /// Origins switched off by an operator.
    pub disabled: Vec<Origin>,
}

/// Told whenever the origin set of an application changes.
pub trait OriginsChangeListener: Send + Sync {
    /// React to the new origin set.
    fn origins_changed(&self, snapshot: &OriginsSnapshot);
}

/// Chooses the origin a request is sent to.
pub trait LoadBalancer: Send + Sync {
    /// Pick an origin, or `None` when no origin can take the request.
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost>;

    /// Hook for strategies that keep state derived from the origin set.
    fn origins_changed(&self, _snapshot: &OriginsSnapshot) {}
}

/// Registers a load balancer as an [`OriginsChangeListener`].
pub struct LoadBalancerListener(pub Arc<dyn LoadBalancer>);

impl OriginsChangeListener for LoadBalancerListener {
    fn origins_changed(&self, snapshot: &OriginsSnapshot) {
        self.0.origins_changed(snapshot);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hosts with a fixed load for strategy tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::routing::object::{HttpRequest, ResponseFuture};

    /// Answers `200` and reports whatever load it is set to.
    #[derive(Default)]
    pub(crate) struct StubHost {
        pub(crate) load: AtomicUsize,
    }

    impl HttpHandler for StubHost {
        fn handle(&self, _request: HttpRequest) -> ResponseFuture {
            Box::pin(async { Ok(http::Response::new(Bytes::new())) })
        }
    }

    impl LoadBalancingMetricSupplier for StubHost {
        fn metric(&self) -> LoadBalancingMetric {
            LoadBalancingMetric::new(self.load.load(Ordering::SeqCst))
        }
    }

    pub(crate) fn host(id: &str, load: usize) -> RemoteHost {
        RemoteHost::new(
            Origin::new("app", id, "localhost", 9000),
            Arc::new(StubHost {
                load: AtomicUsize::new(load),
            }),
        )
    }

    pub(crate) fn active(hosts: Vec<RemoteHost>) -> Arc<ActiveOriginSet> {
        Arc::new(ActiveOriginSet::new(hosts))
    }

    pub(crate) fn ids(hosts: &[Option<RemoteHost>]) -> Vec<Option<String>> {
        hosts
            .iter()
            .map(|h| h.as_ref().map(|h| h.id().to_string()))
            .collect()
    }
}
