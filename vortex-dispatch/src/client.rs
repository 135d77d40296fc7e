//! The backend-service client: turns a request into an origin response.
//!
//! A request is rewritten, routed to an origin chosen by the decorated load
//! balancer, and retried on other origins as the retry policy allows. Successful
//! responses are stamped with the serving origin's id and, for sticky services,
//! with the cookie that pins the client to that origin.

use std::fmt;
use std::sync::{Arc, Weak};

use http::header::{CONTENT_LENGTH, HOST, SET_COOKIE, TRANSFER_ENCODING};
use http::uri::PathAndQuery;
use http::{HeaderName, HeaderValue, Method, Uri};
use parking_lot::Mutex;
use tracing::{debug, error};

use vortex_routing::config::DEFAULT_ORIGIN_ID_HEADER;
use vortex_routing::load_balancer::sticky::{sticky_session_cookie, sticky_session_cookie_name};
use vortex_routing::load_balancer::{DecoratedLoadBalancer, LoadBalancer, Preferences, RemoteHost};
use vortex_routing::metrics::MetricRegistry;
use vortex_routing::retry::{Outcome, RetryContext, RetryNTimes, RetryPolicy};
use vortex_routing::routing::object::{clone_request, request_cookie};
use vortex_routing::{
    HttpHandler, HttpRequest, HttpResponse, ProxyError, ResponseFuture, Result, RewriteRule,
    RewriteRuleset, StickySessionConfig,
};

use crate::inventory::{ListenerId, OriginsInventory};
use crate::origin_stats::{OriginStats, OriginStatsFactory};

/// Upper bound on attempts per request, whatever the retry policy allows.
pub const MAX_RETRY_ATTEMPTS: usize = 3;

/// A load balancer listener registered with an origins inventory on behalf of a client.
///
/// Dropping the registration removes the listener.
#[derive(Debug)]
pub struct ListenerRegistration {
    inventory: Weak<OriginsInventory>,
    id: ListenerId,
}

impl ListenerRegistration {
    /// Remember that listener `id` was registered with `inventory`.
    pub fn new(inventory: &Arc<OriginsInventory>, id: ListenerId) -> Self {
        Self {
            inventory: Arc::downgrade(inventory),
            id,
        }
    }

}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(inventory) = self.inventory.upgrade() {
            inventory.remove_origins_change_listener(self.id);
        }
    }
}

struct ClientInner {
    id: String,
    rewrites: RewriteRuleset,
    origin_stats: Option<OriginStatsFactory>,
    origin_restriction_cookie: Option<String>,
    sticky_session: StickySessionConfig,
    origin_id_header: HeaderName,
    load_balancer: Arc<DecoratedLoadBalancer>,
    retry_policy: Arc<dyn RetryPolicy>,
    metrics: MetricRegistry,
    override_host_header: bool,
    listener: Mutex<Option<ListenerRegistration>>,
}

/// Sends requests of one backend service to its origins.
///
/// Clones share the same chain. The inventory listener registered for the
/// client's load balancer is removed by [`detach_listener`](Self::detach_listener)
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct BackendServiceClient {
    inner: Arc<ClientInner>,
}

impl BackendServiceClient {
    /// Start building a client for backend service `id`.
    pub fn builder(id: impl Into<String>) -> BackendServiceClientBuilder {
        BackendServiceClientBuilder::new(id)
    }

    /// The backend service id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The decorated load balancer choosing origins.
    pub fn load_balancer(&self) -> &DecoratedLoadBalancer {
        &self.inner.load_balancer
    }

    /// Whether responses pin clients to their origin.
    pub fn is_sticky(&self) -> bool {
        self.inner.sticky_session.enabled
    }

    /// Remove the load balancer's listener from the origins inventory.
    pub fn detach_listener(&self) {
        if let Some(registration) = self.inner.listener.lock().take() {
            debug!(backend = %self.inner.id, "detaching load balancer listener");
            drop(registration);
        }
    }

    /// Send `request` to an origin, retrying on others as the retry policy allows.
    pub fn send(&self, request: HttpRequest) -> ResponseFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.send(request).await })
    }
}

impl HttpHandler for BackendServiceClient {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        self.send(request)
    }
}

impl fmt::Debug for BackendServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServiceClient")
            .field("id", &self.inner.id)
            .field("load_balancer", &self.inner.load_balancer.kind())
            .field("sticky", &self.inner.sticky_session.enabled)
            .finish()
    }
}

impl ClientInner {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = self.rewrite(request)?;
        let method = request.method().clone();
        let preferences = self.preferences(&request);

        let Some(mut host) = self.load_balancer.choose(&preferences) else {
            return Err(ProxyError::NoAvailableHosts {
                backend: self.id.clone(),
            });
        };

        let mut previous_origins = Vec::new();
        loop {
            previous_origins.push(host.id().clone());

            match self.dispatch(&host, self.prepare(&request, &host)).await {
                Ok(response) => return Ok(self.finish(response, &host, &method)),
                Err(e) => {
                    error!(backend = %self.id, origin = %host.id(), error = %e, "origin request failed");
                    if previous_origins.len() >= MAX_RETRY_ATTEMPTS {
                        return Err(e);
                    }

                    let context = RetryContext {
                        backend_id: self.id.clone(),
                        current_retry_count: previous_origins.len() - 1,
                        last_error: Some(e.clone()),
                        previous_origins: previous_origins.clone(),
                    };
                    match self
                        .retry_policy
                        .evaluate(&context, self.load_balancer.as_ref(), &preferences)
                    {
                        Outcome {
                            should_retry: true,
                            next_origin: Some(next),
                        } => {
                            debug!(backend = %self.id, origin = %next.id(), "retrying request");
                            host = next;
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    fn rewrite(&self, mut request: HttpRequest) -> Result<HttpRequest> {
        if self.rewrites.is_empty() {
            return Ok(request);
        }
        let current = request
            .uri()
            .path_and_query()
            .map_or("/", PathAndQuery::as_str)
            .to_string();
        let Some(rewritten) = self.rewrites.rewrite(&current) else {
            return Ok(request);
        };

        let mut parts = request.uri().clone().into_parts();
        parts.path_and_query = Some(
            PathAndQuery::try_from(rewritten.as_str())
                .map_err(|e| ProxyError::BadRequest(format!("rewritten url '{rewritten}': {e}")))?,
        );
        *request.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| ProxyError::BadRequest(format!("rewritten url '{rewritten}': {e}")))?;
        debug!(backend = %self.id, from = %current, to = %rewritten, "rewrote request url");
        Ok(request)
    }

    fn preferences(&self, request: &HttpRequest) -> Preferences {
        let preferred = match self.load_balancer.as_ref() {
            DecoratedLoadBalancer::StickySession(_) => {
                request_cookie(request, &sticky_session_cookie_name(&self.id))
            }
            DecoratedLoadBalancer::OriginRestricted(_) => self
                .origin_restriction_cookie
                .as_deref()
                .and_then(|name| request_cookie(request, name)),
            DecoratedLoadBalancer::Plain(_) => None,
        };
        Preferences::preferring(preferred)
    }

    fn prepare(&self, request: &HttpRequest, host: &RemoteHost) -> HttpRequest {
        let mut attempt = clone_request(request);
        if self.override_host_header {
            match HeaderValue::from_str(&host.origin().host_and_port()) {
                Ok(value) => {
                    attempt.headers_mut().insert(HOST, value);
                }
                Err(e) => debug!(origin = %host.id(), error = %e, "origin address is not a valid host header"),
            }
        }
        attempt
    }

    async fn dispatch(&self, host: &RemoteHost, request: HttpRequest) -> Result<HttpResponse> {
        let stats = self
            .origin_stats
            .as_ref()
            .map(|factory| factory.origin_stats(host.origin()));
        let mut cancellation = CancellationGuard(stats.clone());
        let timing = stats.as_ref().map(|s| s.start_timing());

        let result = host.handler().handle(request).await;

        cancellation.disarm();
        if let Some(timing) = timing {
            timing.stop();
        }
        if let Some(stats) = &stats {
            match &result {
                Ok(_) => stats.request_success(),
                Err(_) => stats.request_error(),
            }
        }
        result
    }

    fn finish(&self, mut response: HttpResponse, host: &RemoteHost, method: &Method) -> HttpResponse {
        match HeaderValue::from_str(host.id().as_str()) {
            Ok(value) => {
                response.headers_mut().insert(self.origin_id_header.clone(), value);
            }
            Err(e) => debug!(origin = %host.id(), error = %e, "origin id is not a valid header value"),
        }

        if self.sticky_session.enabled {
            let cookie = sticky_session_cookie(&self.id, host.id().as_str(), self.sticky_session.timeout_seconds);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }

        let status = response.status();
        if status.as_u16() >= 400 {
            self.metrics
                .counter(&format!("origins.response.status.{}", status.as_u16()))
                .increment();
        }

        let bodiless = *method == Method::HEAD
            || status.is_informational()
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED;
        let headers = response.headers_mut();
        if bodiless {
            headers.remove(TRANSFER_ENCODING);
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            *response.body_mut() = bytes::Bytes::new();
        } else if headers.contains_key(TRANSFER_ENCODING) {
            headers.remove(CONTENT_LENGTH);
        }
        response
    }
}

/// Counts the request as cancelled unless disarmed before it is dropped.
struct CancellationGuard(Option<Arc<OriginStats>>);

impl CancellationGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.0.take() {
            stats.request_cancelled();
        }
    }
}

/// Builder for [`BackendServiceClient`].
pub struct BackendServiceClientBuilder {
    id: String,
    rewrites: Vec<RewriteRule>,
    origin_stats: Option<OriginStatsFactory>,
    origin_restriction_cookie: Option<String>,
    sticky_session: StickySessionConfig,
    origin_id_header: String,
    load_balancer: Option<Arc<DecoratedLoadBalancer>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    metrics: MetricRegistry,
    override_host_header: bool,
    listener: Option<ListenerRegistration>,
}

impl BackendServiceClientBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rewrites: Vec::new(),
            origin_stats: None,
            origin_restriction_cookie: None,
            sticky_session: StickySessionConfig::default(),
            origin_id_header: DEFAULT_ORIGIN_ID_HEADER.to_string(),
            load_balancer: None,
            retry_policy: None,
            metrics: MetricRegistry::new(),
            override_host_header: false,
            listener: None,
        }
    }

    /// URL rewrites applied before dispatch. The first matching rule wins.
    pub fn rewrites(mut self, rewrites: Vec<RewriteRule>) -> Self {
        self.rewrites = rewrites;
        self
    }

    /// Record per-origin request statistics.
    pub fn origin_stats(mut self, factory: OriginStatsFactory) -> Self {
        self.origin_stats = Some(factory);
        self
    }

    /// Cookie carrying origin restriction patterns.
    pub fn origin_restriction_cookie(mut self, cookie: Option<String>) -> Self {
        self.origin_restriction_cookie = cookie;
        self
    }

    /// Sticky session settings.
    pub fn sticky_session(mut self, config: StickySessionConfig) -> Self {
        self.sticky_session = config;
        self
    }

    /// Response header naming the serving origin.
    pub fn origin_id_header(mut self, header: impl Into<String>) -> Self {
        self.origin_id_header = header.into();
        self
    }

    /// The load balancer choosing origins. Required.
    pub fn load_balancer(mut self, load_balancer: Arc<DecoratedLoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    /// Retry policy. Defaults to a single retry.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Registry receiving response status counters.
    pub fn metrics(mut self, metrics: MetricRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the `Host` header with the origin's address.
    pub fn override_host_header(mut self, enabled: bool) -> Self {
        self.override_host_header = enabled;
        self
    }

    /// The inventory listener to remove when the client goes away.
    pub fn listener(mut self, registration: ListenerRegistration) -> Self {
        self.listener = Some(registration);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<BackendServiceClient> {
        let load_balancer = self.load_balancer.ok_or_else(|| {
            ProxyError::Configuration(format!("backend service '{}' has no load balancer", self.id))
        })?;
        let origin_id_header = HeaderName::try_from(self.origin_id_header.as_str()).map_err(|e| {
            ProxyError::Configuration(format!("origin id header '{}': {e}", self.origin_id_header))
        })?;
        let rewrites = RewriteRuleset::new(&self.rewrites)?;

        Ok(BackendServiceClient {
            inner: Arc::new(ClientInner {
                id: self.id,
                rewrites,
                origin_stats: self.origin_stats,
                origin_restriction_cookie: self.origin_restriction_cookie,
                sticky_session: self.sticky_session,
                origin_id_header,
                load_balancer,
                retry_policy: self
                    .retry_policy
                    .unwrap_or_else(|| Arc::new(RetryNTimes::new(1))),
                metrics: self.metrics,
                override_host_header: self.override_host_header,
                listener: Mutex::new(self.listener),
            }),
        })
    }
}
