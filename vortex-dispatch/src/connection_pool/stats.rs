//! Publishes connection pool figures as gauges.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use vortex_routing::metrics::{origin_metrics_scope, GaugeFn, MetricRegistry};
use vortex_routing::{ConnectionPoolSettings, Origin, Result};

use crate::connection_pool::{Connection, ConnectionPool, ConnectionPoolStats};

type StatReader = fn(&dyn ConnectionPoolStats) -> u64;

const GAUGES: [(&str, StatReader); 8] = [
    ("busy-connections", |s: &dyn ConnectionPoolStats| s.busy_connection_count()),
    ("pending-connections", |s: &dyn ConnectionPoolStats| s.pending_connection_count()),
    ("available-connections", |s: &dyn ConnectionPoolStats| s.available_connection_count()),
    ("connection-attempts", |s: &dyn ConnectionPoolStats| s.connection_attempts()),
    ("connection-failures", |s: &dyn ConnectionPoolStats| s.connection_failures()),
    ("connections-closed", |s: &dyn ConnectionPoolStats| s.closed_connections()),
    ("connections-terminated", |s: &dyn ConnectionPoolStats| s.terminated_connections()),
    ("connections-in-establishment", |s: &dyn ConnectionPoolStats| s.connections_in_establishment()),
];

/// A connection pool that reports its figures under
/// `origins.<appId>.<originId>.connectionspool`.
///
/// Behaves exactly like the wrapped pool. Closing it closes the wrapped pool and
/// then removes every gauge it registered.
///
/// A newer pool for the same origin takes the gauge names over, so a chain that is
/// rebuilt keeps reporting while its predecessor drains. Closing the predecessor
/// then leaves those gauges alone.
pub struct StatsReportingConnectionPool {
    pool: Arc<dyn ConnectionPool>,
    scope: MetricRegistry,
    registered: Vec<(&'static str, GaugeFn)>,
}

impl StatsReportingConnectionPool {
    /// Wrap `pool`, registering its gauges in `metrics`.
    pub fn new(pool: Arc<dyn ConnectionPool>, metrics: &MetricRegistry) -> Self {
        let scope = metrics.scope(&format!("{}.connectionspool", origin_metrics_scope(pool.origin())));
        let stats = pool.stats();

        let registered = GAUGES
            .iter()
            .map(|(name, read)| {
                let stats = Arc::clone(&stats);
                let read = *read;
                let gauge: GaugeFn = Arc::new(move || read(stats.as_ref()));
                if scope.replace_gauge(name, Arc::clone(&gauge)).is_some() {
                    debug!(gauge = %scope.name(name), "taking over previously registered gauge");
                }
                (*name, gauge)
            })
            .collect();

        Self {
            pool,
            scope,
            registered,
        }
    }

    /// The wrapped pool.
    pub fn delegate(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }
}

impl ConnectionPool for StatsReportingConnectionPool {
    fn origin(&self) -> &Origin {
        self.pool.origin()
    }

    fn borrow(&self) -> BoxFuture<'static, Result<Connection>> {
        self.pool.borrow()
    }

    fn return_connection(&self, connection: Connection) {
        self.pool.return_connection(connection);
    }

    fn close_connection(&self, connection: Connection) {
        self.pool.close_connection(connection);
    }

    fn is_exhausted(&self) -> bool {
        self.pool.is_exhausted()
    }

    fn stats(&self) -> Arc<dyn ConnectionPoolStats> {
        self.pool.stats()
    }

    fn settings(&self) -> &ConnectionPoolSettings {
        self.pool.settings()
    }

    fn close(&self) {
        self.pool.close();
        for (name, gauge) in &self.registered {
            self.scope.deregister_gauge(name, gauge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use vortex_routing::ProxyError;

    #[derive(Default)]
    struct FixedStats {
        busy: AtomicU64,
    }

    impl ConnectionPoolStats for FixedStats {
        fn busy_connection_count(&self) -> u64 {
            self.busy.load(Ordering::SeqCst)
        }
        fn pending_connection_count(&self) -> u64 {
            2
        }
        fn available_connection_count(&self) -> u64 {
            3
        }
        fn connection_attempts(&self) -> u64 {
            4
        }
        fn connection_failures(&self) -> u64 {
            5
        }
        fn closed_connections(&self) -> u64 {
            6
        }
        fn terminated_connections(&self) -> u64 {
            7
        }
        fn connections_in_establishment(&self) -> u64 {
            8
        }
    }

    struct StubPool {
        origin: Origin,
        settings: ConnectionPoolSettings,
        stats: Arc<FixedStats>,
        closed: Arc<AtomicBool>,
    }

    impl ConnectionPool for StubPool {
        fn origin(&self) -> &Origin {
            &self.origin
        }
        fn borrow(&self) -> BoxFuture<'static, Result<Connection>> {
            Box::pin(async { Err(ProxyError::transport("stub", "no connections")) })
        }
        fn return_connection(&self, _connection: Connection) {}
        fn close_connection(&self, _connection: Connection) {}
        fn is_exhausted(&self) -> bool {
            false
        }
        fn stats(&self) -> Arc<dyn ConnectionPoolStats> {
            self.stats.clone()
        }
        fn settings(&self) -> &ConnectionPoolSettings {
            &self.settings
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn stub() -> (Arc<StubPool>, Arc<FixedStats>, Arc<AtomicBool>) {
        let stats = Arc::new(FixedStats::default());
        let closed = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(StubPool {
            origin: Origin::new("shop", "shop-01", "localhost", 8080),
            settings: ConnectionPoolSettings::default(),
            stats: stats.clone(),
            closed: closed.clone(),
        });
        (pool, stats, closed)
    }

    const PREFIX: &str = "origins.shop.shop-01.connectionspool";

    #[test]
    fn registers_live_gauges_under_origin_scope() {
        let metrics = MetricRegistry::new();
        let (pool, stats, _) = stub();
        let _reporting = StatsReportingConnectionPool::new(pool, &metrics);

        assert_eq!(metrics.gauge_names().len(), 8);
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.busy-connections")), Some(0));
        stats.busy.store(11, Ordering::SeqCst);
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.busy-connections")), Some(11));
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.connections-in-establishment")), Some(8));
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.connections-terminated")), Some(7));
    }

    #[test]
    fn close_closes_pool_then_removes_gauges() {
        let metrics = MetricRegistry::new();
        let (pool, _, closed) = stub();
        let reporting = StatsReportingConnectionPool::new(pool, &metrics);

        reporting.close();

        assert!(closed.load(Ordering::SeqCst));
        assert!(metrics.gauge_names().is_empty());
    }

    #[test]
    fn replacement_pool_keeps_reporting_after_predecessor_closes() {
        let metrics = MetricRegistry::new();
        let (old_pool, old_stats, _) = stub();
        let old = StatsReportingConnectionPool::new(old_pool, &metrics);
        old_stats.busy.store(5, Ordering::SeqCst);

        let (new_pool, new_stats, _) = stub();
        let new = StatsReportingConnectionPool::new(new_pool, &metrics);
        new_stats.busy.store(1, Ordering::SeqCst);
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.busy-connections")), Some(1));

        old.close();
        assert_eq!(metrics.gauge_names().len(), 8);
        assert_eq!(metrics.gauge_value(&format!("{PREFIX}.busy-connections")), Some(1));

        new.close();
        assert!(metrics.gauge_names().is_empty());
    }
}
