//! Builds the connection pool of each origin.

use std::sync::Arc;

use vortex_routing::metrics::MetricRegistry;
use vortex_routing::{BackendService, ConnectionPoolSettings, Origin, Result};

use crate::connection_pool::{ConnectionPool, HttpConnectionPool, OriginConnector, StatsReportingConnectionPool};
use crate::tls::OriginTls;

/// Creates a connection pool for an origin.
pub trait ConnectionPoolFactory: Send + Sync {
    /// A fresh pool for `origin`.
    fn create(&self, origin: &Origin) -> Arc<dyn ConnectionPool>;
}

/// Builds [`HttpConnectionPool`]s, wrapped in a [`StatsReportingConnectionPool`]
/// when a metric registry is given.
#[derive(Debug, Clone)]
pub struct HttpConnectionPoolFactory {
    settings: ConnectionPoolSettings,
    connector: OriginConnector,
    metrics: Option<MetricRegistry>,
}

impl HttpConnectionPoolFactory {
    /// A factory for plain-text pools with the given limits.
    pub fn new(settings: ConnectionPoolSettings) -> Self {
        Self {
            settings,
            connector: OriginConnector::Plain,
            metrics: None,
        }
    }

    /// A factory set up from a backend service's pool and TLS settings.
    pub fn for_service(service: &BackendService) -> Result<Self> {
        let connector = match &service.tls_settings {
            Some(tls) => OriginConnector::Tls(OriginTls::from_settings(tls)?),
            None => OriginConnector::Plain,
        };
        Ok(Self {
            settings: service.connection_pool.clone(),
            connector,
            metrics: None,
        })
    }

    /// Report pool figures to `metrics`.
    pub fn with_metrics(mut self, metrics: MetricRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl ConnectionPoolFactory for HttpConnectionPoolFactory {
    fn create(&self, origin: &Origin) -> Arc<dyn ConnectionPool> {
        let pool: Arc<dyn ConnectionPool> = Arc::new(HttpConnectionPool::new(
            origin.clone(),
            self.settings.clone(),
            self.connector.clone(),
        ));
        match &self.metrics {
            Some(metrics) => Arc::new(StatsReportingConnectionPool::new(pool, metrics)),
            None => pool,
        }
    }
}
