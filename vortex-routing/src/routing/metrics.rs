//! In-flight request accounting for routing objects.
//!
//! Every routing object stored in the registry is wrapped in a
//! [`RoutingMetricsHandler`]. The handler counts requests from the moment they are
//! admitted until their response future resolves, fails, or is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::load_balancer::{LoadBalancingMetric, LoadBalancingMetricSupplier};
use crate::routing::object::{HttpHandler, HttpRequest, ResponseFuture, RoutingObject};

/// Live request counters of one routing object.
#[derive(Debug, Default)]
pub struct RoutingMetric {
    ongoing: AtomicUsize,
    idle: Notify,
}

impl RoutingMetric {
    /// Number of requests currently being processed.
    pub fn ongoing_connections(&self) -> usize {
        self.ongoing.load(Ordering::Acquire)
    }

    /// Resolves once no request is in flight.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.ongoing_connections() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A RAII guard that keeps a request counted as ongoing until it is dropped.
///
/// Success, error and cancellation all end in the guard being dropped exactly once.
struct OngoingRequestGuard {
    metric: Arc<RoutingMetric>,
}

impl OngoingRequestGuard {
    fn admit(metric: &Arc<RoutingMetric>) -> Self {
        metric.ongoing.fetch_add(1, Ordering::AcqRel);
        Self {
            metric: Arc::clone(metric),
        }
    }
}

impl Drop for OngoingRequestGuard {
    fn drop(&mut self) {
        if self.metric.ongoing.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.metric.idle.notify_waiters();
        }
    }
}

/// Decorates a routing object with in-flight request tracking.
pub struct RoutingMetricsHandler {
    delegate: Arc<dyn RoutingObject>,
    metric: Arc<RoutingMetric>,
}

impl RoutingMetricsHandler {
    /// Wrap a routing object.
    pub fn new(delegate: Arc<dyn RoutingObject>) -> Self {
        Self {
            delegate,
            metric: Arc::new(RoutingMetric::default()),
        }
    }

    /// The live counters of the wrapped object.
    pub fn metric(&self) -> &RoutingMetric {
        &self.metric
    }

    /// The undecorated routing object.
    pub fn delegate(&self) -> &Arc<dyn RoutingObject> {
        &self.delegate
    }
}

impl HttpHandler for RoutingMetricsHandler {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        let guard = OngoingRequestGuard::admit(&self.metric);
        let response = self.delegate.handle(request);

        Box::pin(async move {
            let _guard = guard;
            response.await
        })
    }
}

impl RoutingObject for RoutingMetricsHandler {
    fn stop(&self) {
        self.delegate.stop();
    }
}

impl LoadBalancingMetricSupplier for RoutingMetricsHandler {
    fn metric(&self) -> LoadBalancingMetric {
        LoadBalancingMetric::new(self.metric.ongoing_connections())
    }
}

impl std::fmt::Debug for RoutingMetricsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingMetricsHandler")
            .field("ongoing_connections", &self.metric.ongoing_connections())
            .finish()
    }
}
