//! Per-origin connection pools.

use std::sync::Arc;

use futures::future::BoxFuture;

use vortex_routing::{ConnectionPoolSettings, Origin, Result};

pub mod connection;
pub mod factory;
pub mod pool;
pub mod stats;

pub use connection::{Connection, OriginConnector};
pub use factory::{ConnectionPoolFactory, HttpConnectionPoolFactory};
pub use pool::HttpConnectionPool;
pub use stats::StatsReportingConnectionPool;

/// Live figures of a connection pool.
pub trait ConnectionPoolStats: Send + Sync {
    /// Connections currently lent out.
    fn busy_connection_count(&self) -> u64;
    /// Borrowers waiting for a connection.
    fn pending_connection_count(&self) -> u64;
    /// Idle connections ready to be lent.
    fn available_connection_count(&self) -> u64;
    /// Connections the pool tried to open.
    fn connection_attempts(&self) -> u64;
    /// Connection attempts that failed.
    fn connection_failures(&self) -> u64;
    /// Connections closed by the pool.
    fn closed_connections(&self) -> u64;
    /// Connections found closed by the origin.
    fn terminated_connections(&self) -> u64;
    /// Connections being opened right now.
    fn connections_in_establishment(&self) -> u64;
}

/// Lends connections to one origin.
pub trait ConnectionPool: Send + Sync {
    /// The origin the pool connects to.
    fn origin(&self) -> &Origin;

    /// Borrow a connection, reusing an idle one or opening a new one.
    fn borrow(&self) -> BoxFuture<'static, Result<Connection>>;

    /// Give a healthy connection back for reuse.
    fn return_connection(&self, connection: Connection);

    /// Discard a connection that must not be reused.
    fn close_connection(&self, connection: Connection);

    /// Whether no connection can be lent without exceeding the pool limits.
    fn is_exhausted(&self) -> bool;

    /// Live figures of the pool.
    fn stats(&self) -> Arc<dyn ConnectionPoolStats>;

    /// The limits the pool enforces.
    fn settings(&self) -> &ConnectionPoolSettings;

    /// Close every idle connection and refuse further borrows.
    fn close(&self);
}
