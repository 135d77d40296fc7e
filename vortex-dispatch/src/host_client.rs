//! Sends requests to one origin over its connection pool.

use std::sync::Arc;

use tracing::debug;

use vortex_routing::load_balancer::{LoadBalancingMetric, LoadBalancingMetricSupplier};
use vortex_routing::{HttpHandler, HttpRequest, Origin, ResponseFuture};

use crate::connection_pool::ConnectionPool;

/// Borrows a connection per request, returning it after a clean exchange and
/// closing it after a failure. Its load is the pool's busy connection count.
#[derive(Clone)]
pub struct HostClient {
    pool: Arc<dyn ConnectionPool>,
}

impl HostClient {
    /// A client sending through `pool`.
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    /// The origin this client talks to.
    pub fn origin(&self) -> &Origin {
        self.pool.origin()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Close the underlying pool.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl HttpHandler for HostClient {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        let pool = Arc::clone(&self.pool);
        Box::pin(async move {
            let mut connection = pool.borrow().await?;
            match connection.send(request).await {
                Ok(response) => {
                    pool.return_connection(connection);
                    Ok(response)
                }
                Err(e) => {
                    debug!(origin = %pool.origin().id, error = %e, "closing failed connection");
                    pool.close_connection(connection);
                    Err(e)
                }
            }
        })
    }
}

impl LoadBalancingMetricSupplier for HostClient {
    fn metric(&self) -> LoadBalancingMetric {
        let stats = self.pool.stats();
        let load = stats.busy_connection_count() + stats.pending_connection_count();
        LoadBalancingMetric::new(usize::try_from(load).unwrap_or(usize::MAX))
    }
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("origin", &self.pool.origin().id)
            .finish()
    }
}
