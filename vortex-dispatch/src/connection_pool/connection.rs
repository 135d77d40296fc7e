//! Physical HTTP/1.1 connections to origins.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use vortex_routing::{HttpRequest, HttpResponse, Origin, OriginId, ProxyError, Result};

use crate::connection_pool::pool::PoolCounters;
use crate::tls::OriginTls;

/// Opens connections to origins, in plain text or over TLS.
#[derive(Debug, Clone, Default)]
pub enum OriginConnector {
    /// Plain TCP.
    #[default]
    Plain,
    /// TLS on top of TCP.
    Tls(OriginTls),
}

impl OriginConnector {
    /// Open a connection to `origin` and complete the HTTP/1.1 handshake.
    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        timeout: Duration,
    ) -> Result<SendRequest<Full<Bytes>>> {
        let address = origin.host_and_port();
        let stream = time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ProxyError::transport(origin.id.as_str(), "connect timed out"))?
            .map_err(|e| ProxyError::transport(origin.id.as_str(), e))?;
        let _ = stream.set_nodelay(true);

        match self {
            Self::Plain => handshake(origin, TokioIo::new(stream)).await,
            Self::Tls(tls) => {
                let server_name = tls.server_name(&origin.host)?;
                let stream = time::timeout(timeout, tls.connector().connect(server_name, stream))
                    .await
                    .map_err(|_| ProxyError::transport(origin.id.as_str(), "TLS handshake timed out"))?
                    .map_err(|e| ProxyError::transport(origin.id.as_str(), e))?;
                handshake(origin, TokioIo::new(stream)).await
            }
        }
    }
}

async fn handshake<I>(origin: &Origin, io: I) -> Result<SendRequest<Full<Bytes>>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(io)
        .await
        .map_err(|e| ProxyError::transport(origin.id.as_str(), e))?;

    let origin_id = origin.id.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(origin = %origin_id, error = %e, "origin connection ended");
        }
    });

    Ok(sender)
}

/// A connection borrowed from a pool.
///
/// Counts as busy until it is dropped. A connection dropped without being returned
/// to its pool, e.g. because the request using it was cancelled, is closed.
pub struct Connection {
    origin: OriginId,
    sender: Option<SendRequest<Full<Bytes>>>,
    counters: Arc<PoolCounters>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Connection {
    pub(crate) fn new(
        origin: OriginId,
        sender: SendRequest<Full<Bytes>>,
        counters: Arc<PoolCounters>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Self {
        counters.busy_acquired();
        Self {
            origin,
            sender: Some(sender),
            counters,
            _permit: permit,
        }
    }

    /// The origin the connection leads to.
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    /// Whether the connection can still carry requests.
    pub fn is_connected(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Send a request and buffer the whole response.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let origin = self.origin.as_str().to_string();
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| ProxyError::transport(origin.as_str(), "connection already released"))?;

        sender
            .ready()
            .await
            .map_err(|e| ProxyError::transport(origin.as_str(), e))?;

        let (parts, body) = request.into_parts();
        let response = sender
            .send_request(http::Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| ProxyError::transport(origin.as_str(), e))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::transport(origin.as_str(), e))?
            .to_bytes();

        Ok(http::Response::from_parts(parts, body))
    }

    /// Take the sender out so the pool can keep it idle.
    pub(crate) fn release(mut self) -> Option<SendRequest<Full<Bytes>>> {
        self.sender.take()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.counters.busy_released();
        if self.sender.take().is_some() {
            self.counters.closed();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("origin", &self.origin)
            .field("connected", &self.is_connected())
            .finish()
    }
}
