//! Per-origin request statistics.

use std::sync::Arc;

use dashmap::DashMap;

use vortex_routing::metrics::{origin_metrics_scope, Counter, MetricRegistry, Timer, TimerContext};
use vortex_routing::Origin;

/// Request outcome counters of one origin, under `origins.<appId>.<originId>`.
#[derive(Debug)]
pub struct OriginStats {
    success: Arc<Counter>,
    error: Arc<Counter>,
    cancelled: Arc<Counter>,
    latency: Arc<Timer>,
}

impl OriginStats {
    fn new(scope: &MetricRegistry) -> Self {
        Self {
            success: scope.counter("requests.success"),
            error: scope.counter("requests.error"),
            cancelled: scope.counter("requests.cancelled"),
            latency: scope.timer("requests.latency"),
        }
    }

    /// Count a request answered by the origin.
    pub fn request_success(&self) {
        self.success.increment();
    }

    /// Count a request that failed in transport.
    pub fn request_error(&self) {
        self.error.increment();
    }

    /// Count a request abandoned by the client.
    pub fn request_cancelled(&self) {
        self.cancelled.increment();
    }

    /// Time one request to the origin.
    pub fn start_timing(&self) -> TimerContext {
        self.latency.start_timing()
    }

    /// Requests answered so far.
    pub fn successes(&self) -> u64 {
        self.success.count()
    }

    /// Requests failed so far.
    pub fn errors(&self) -> u64 {
        self.error.count()
    }

    /// Requests cancelled so far.
    pub fn cancellations(&self) -> u64 {
        self.cancelled.count()
    }
}

/// Hands out one [`OriginStats`] per origin.
#[derive(Debug, Clone)]
pub struct OriginStatsFactory {
    metrics: MetricRegistry,
    cache: Arc<DashMap<String, Arc<OriginStats>>>,
}

impl OriginStatsFactory {
    /// Record origin statistics in `metrics`.
    pub fn new(metrics: MetricRegistry) -> Self {
        Self {
            metrics,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Statistics of `origin`, created on first use.
    pub fn origin_stats(&self, origin: &Origin) -> Arc<OriginStats> {
        let scope = origin_metrics_scope(origin);
        let entry = self
            .cache
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(OriginStats::new(&self.metrics.scope(&scope))));
        Arc::clone(entry.value())
    }
}
