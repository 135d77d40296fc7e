//! Lock-free hot pool of HTTP/1.1 connections to one origin.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::client::conn::http1::SendRequest;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, warn};

use vortex_routing::{ConnectionPoolSettings, Origin, ProxyError, Result};

use crate::connection_pool::{Connection, ConnectionPool, ConnectionPoolStats, OriginConnector};

/// Counters behind [`ConnectionPoolStats`].
#[derive(Debug, Default)]
pub struct PoolCounters {
    busy: AtomicU64,
    pending: AtomicU64,
    available: AtomicU64,
    attempts: AtomicU64,
    failures: AtomicU64,
    closed: AtomicU64,
    terminated: AtomicU64,
    establishing: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn busy_acquired(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn busy_released(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl ConnectionPoolStats for PoolCounters {
    fn busy_connection_count(&self) -> u64 {
        self.busy.load(Ordering::Acquire)
    }

    fn pending_connection_count(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    fn available_connection_count(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    fn connection_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn connection_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn closed_connections(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    fn terminated_connections(&self) -> u64 {
        self.terminated.load(Ordering::Relaxed)
    }

    fn connections_in_establishment(&self) -> u64 {
        self.establishing.load(Ordering::Acquire)
    }
}

/// Keeps a gauge raised for as long as it lives.
struct Raised<'a>(&'a AtomicU64);

impl<'a> Raised<'a> {
    fn raise(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self(gauge)
    }
}

impl Drop for Raised<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct PoolInner {
    origin: Origin,
    settings: ConnectionPoolSettings,
    connector: OriginConnector,
    idle: SegQueue<SendRequest<Full<Bytes>>>,
    permits: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    closed: AtomicBool,
}

impl PoolInner {
    /// Pops idle senders until one is still open.
    fn try_pop(&self) -> Option<SendRequest<Full<Bytes>>> {
        while let Some(sender) = self.idle.pop() {
            self.counters.available.fetch_sub(1, Ordering::AcqRel);
            if !sender.is_closed() {
                return Some(sender);
            }
            self.counters.terminated.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    async fn borrow(self: Arc<Self>) -> Result<Connection> {
        let origin = self.origin.id.as_str();
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::transport(origin, "connection pool closed"));
        }
        if self.permits.available_permits() == 0
            && self.counters.pending.load(Ordering::Acquire)
                >= self.settings.max_pending_connections_per_host as u64
        {
            warn!(origin = %origin, "connection pool exhausted");
            return Err(ProxyError::transport(origin, "connection pool exhausted"));
        }

        let timeout = Duration::from_millis(self.settings.connect_timeout_millis);
        let permit = {
            let _pending = Raised::raise(&self.counters.pending);
            time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
                .await
                .map_err(|_| ProxyError::transport(origin, "timed out waiting for a connection"))?
                .map_err(|_| ProxyError::transport(origin, "connection pool closed"))?
        };

        if let Some(sender) = self.try_pop() {
            return Ok(Connection::new(
                self.origin.id.clone(),
                sender,
                Arc::clone(&self.counters),
                permit,
            ));
        }

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let connected = {
            let _establishing = Raised::raise(&self.counters.establishing);
            self.connector.connect(&self.origin, timeout).await
        };

        match connected {
            Ok(sender) => {
                debug!(origin = %origin, "opened origin connection");
                Ok(Connection::new(
                    self.origin.id.clone(),
                    sender,
                    Arc::clone(&self.counters),
                    permit,
                ))
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// A lock-free pool of HTTP/1.1 connections to one origin.
///
/// Idle senders wait in a `SegQueue`; a semaphore caps the connections lent out or
/// being opened at `max_connections_per_host`.
#[derive(Clone)]
pub struct HttpConnectionPool {
    inner: Arc<PoolInner>,
}

impl HttpConnectionPool {
    /// Create an empty pool for `origin`.
    pub fn new(origin: Origin, settings: ConnectionPoolSettings, connector: OriginConnector) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections_per_host));
        Self {
            inner: Arc::new(PoolInner {
                origin,
                settings,
                connector,
                idle: SegQueue::new(),
                permits,
                counters: Arc::new(PoolCounters::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl ConnectionPool for HttpConnectionPool {
    fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    fn borrow(&self) -> BoxFuture<'static, Result<Connection>> {
        Box::pin(Arc::clone(&self.inner).borrow())
    }

    fn return_connection(&self, connection: Connection) {
        if self.inner.closed.load(Ordering::Acquire) || !connection.is_connected() {
            self.close_connection(connection);
            return;
        }
        if let Some(sender) = connection.release() {
            self.inner.counters.available.fetch_add(1, Ordering::AcqRel);
            self.inner.idle.push(sender);
        }
    }

    fn close_connection(&self, connection: Connection) {
        drop(connection);
    }

    fn is_exhausted(&self) -> bool {
        self.inner.permits.available_permits() == 0
            && self.inner.counters.pending.load(Ordering::Acquire)
                >= self.inner.settings.max_pending_connections_per_host as u64
    }

    fn stats(&self) -> Arc<dyn ConnectionPoolStats> {
        self.inner.counters.clone()
    }

    fn settings(&self) -> &ConnectionPoolSettings {
        &self.inner.settings
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        while self.inner.try_pop().is_some() {
            self.inner.counters.closed();
        }
        debug!(origin = %self.inner.origin.id, "connection pool closed");
    }
}

impl std::fmt::Debug for HttpConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnectionPool")
            .field("origin", &self.inner.origin.id)
            .field("busy", &self.inner.counters.busy_connection_count())
            .field("available", &self.inner.counters.available_connection_count())
            .finish()
    }
}
