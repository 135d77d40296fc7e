//! Keeps one live dispatch chain per declared backend service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use vortex_routing::routing::record::source_tag;
use vortex_routing::{
    BackendService, HttpHandler, HttpRequest, ProxyError, ResponseFuture, Result, RoutingObject,
    RoutingObjectRecord, RoutingStore,
};

use crate::factory::BackendServiceClientFactory;
use crate::routing_objects::{BackendServiceProxy, BACKEND_SERVICE_PROXY};

struct Deployed {
    service: BackendService,
    proxy: Arc<BackendServiceProxy>,
}

#[derive(Clone)]
struct Route {
    path: String,
    id: String,
    record: RoutingObjectRecord,
}

/// Applies backend service declarations to a routing registry, and routes
/// requests to them by longest path prefix.
///
/// Every declared service gets one record in the registry, keyed by its id. A
/// declaration that changes gets a fresh chain; the replaced chain drains the
/// requests already admitted to it and is then stopped.
pub struct BackendServicesRouter {
    store: RoutingStore<RoutingObjectRecord>,
    factory: BackendServiceClientFactory,
    provider: String,
    declarations: Mutex<BTreeMap<String, Deployed>>,
    routes: ArcSwap<Vec<Route>>,
}

impl BackendServicesRouter {
    /// A router publishing into `store` on behalf of `provider`.
    pub fn new(
        store: RoutingStore<RoutingObjectRecord>,
        factory: BackendServiceClientFactory,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            store,
            factory,
            provider: provider.into(),
            declarations: Mutex::new(BTreeMap::new()),
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// The registry the chains are published in.
    pub fn store(&self) -> &RoutingStore<RoutingObjectRecord> {
        &self.store
    }

    /// Replace the whole set of backend services.
    ///
    /// All declarations are validated and every changed chain is built before
    /// anything is published. If one chain cannot be built, the chains built so far
    /// are stopped and the served set is left as it was.
    ///
    /// Replaced and removed chains leave routing at once but are only stopped after
    /// the requests already admitted to them have finished.
    pub fn apply(&self, services: Vec<BackendService>) -> Result<()> {
        let mut seen = BTreeSet::new();
        for service in &services {
            service.validate()?;
            if !seen.insert(service.id.as_str()) {
                return Err(ProxyError::MalformedBackendService(format!(
                    "backend service '{}' is declared twice",
                    service.id
                )));
            }
        }

        let mut declarations = self.declarations.lock();

        let mut built: Vec<(Deployed, RoutingObjectRecord)> = Vec::new();
        for service in &services {
            if declarations.get(&service.id).is_some_and(|deployed| deployed.service == *service) {
                debug!(backend = %service.id, "backend service unchanged");
                continue;
            }
            match self.build(service) {
                Ok(chain) => built.push(chain),
                Err(e) => {
                    warn!(backend = %service.id, error = %e, "backend service update abandoned");
                    for (_, record) in built {
                        record.stop();
                    }
                    return Err(e);
                }
            }
        }

        for (deployed, record) in built {
            let id = deployed.service.id.clone();
            let replaced = self.store.insert(id.clone(), record);
            let previous = declarations.insert(id.clone(), deployed);
            match replaced {
                Some(old) => {
                    info!(backend = %id, "backend service updated");
                    retire(&id, old, previous.as_ref());
                }
                None => info!(backend = %id, "backend service added"),
            }
        }

        let removed: Vec<String> = declarations
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            let previous = declarations.remove(&id);
            if let Some(record) = self.store.remove(&id) {
                info!(backend = %id, "backend service removed");
                retire(&id, record, previous.as_ref());
            }
        }

        self.rebuild_routes(&declarations);
        Ok(())
    }

    fn build(&self, service: &BackendService) -> Result<(Deployed, RoutingObjectRecord)> {
        let config = serde_json::to_value(service)
            .map_err(|e| ProxyError::Configuration(format!("backend service '{}': {e}", service.id)))?;
        let proxy = Arc::new(BackendServiceProxy::create(service, &self.factory)?);
        let record = RoutingObjectRecord::create(
            BACKEND_SERVICE_PROXY,
            [source_tag(&self.provider)],
            config,
            Arc::clone(&proxy) as Arc<dyn RoutingObject>,
        );
        let deployed = Deployed {
            service: service.clone(),
            proxy,
        };
        Ok((deployed, record))
    }

    /// The live proxy of backend service `id`.
    pub fn proxy(&self, id: &str) -> Option<Arc<BackendServiceProxy>> {
        self.declarations
            .lock()
            .get(id)
            .map(|deployed| Arc::clone(&deployed.proxy))
    }

    /// Ids of the backend services currently served.
    pub fn service_ids(&self) -> Vec<String> {
        self.declarations.lock().keys().cloned().collect()
    }

    /// Stop every chain and remove it from the registry.
    pub fn clear(&self) {
        let mut declarations = self.declarations.lock();
        for id in std::mem::take(&mut *declarations).into_keys() {
            if let Some(record) = self.store.remove(&id) {
                record.stop();
            }
        }
        self.routes.store(Arc::new(Vec::new()));
    }

    fn rebuild_routes(&self, declarations: &BTreeMap<String, Deployed>) {
        let snapshot = self.store.snapshot();
        let mut routes: Vec<Route> = declarations
            .values()
            .filter_map(|Deployed { service, .. }| {
                snapshot.entries().get(&service.id).map(|record| Route {
                    path: service.path.clone(),
                    id: service.id.clone(),
                    record: record.clone(),
                })
            })
            .collect();
        routes.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.id.cmp(&b.id)));
        self.routes.store(Arc::new(routes));
    }

    fn route(&self, path: &str) -> Option<Route> {
        self.routes
            .load()
            .iter()
            .find(|route| matches_prefix(&route.path, path))
            .cloned()
    }
}

/// Stops a chain that left routing once its admitted requests have finished.
fn retire(id: &str, record: RoutingObjectRecord, previous: Option<&Deployed>) {
    if let Some(deployed) = previous {
        deployed.proxy.client().detach_listener();
    }

    let ongoing = record.routing_object().metric().ongoing_connections();
    if ongoing == 0 {
        record.stop();
        return;
    }

    match Handle::try_current() {
        Ok(handle) => {
            debug!(backend = %id, ongoing, "draining backend service");
            let id = id.to_string();
            handle.spawn(async move {
                record.routing_object().metric().idle().await;
                debug!(backend = %id, "backend service drained");
                record.stop();
            });
        }
        Err(_) => {
            warn!(backend = %id, ongoing, "no runtime to drain on, stopping at once");
            record.stop();
        }
    }
}

fn matches_prefix(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix)
        && (prefix.ends_with('/') || path.len() == prefix.len() || path[prefix.len()..].starts_with('/'))
}

impl HttpHandler for BackendServicesRouter {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        match self.route(request.uri().path()) {
            Some(route) => {
                debug!(backend = %route.id, path = %request.uri().path(), "routing request");
                route.record.routing_object().handle(request)
            }
            None => {
                let path = request.uri().path().to_string();
                Box::pin(async move { Err(ProxyError::NoServiceConfigured { path }) })
            }
        }
    }
}

impl RoutingObject for BackendServicesRouter {
    fn stop(&self) {
        self.clear();
    }
}

impl std::fmt::Debug for BackendServicesRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendServicesRouter")
            .field("provider", &self.provider)
            .field("services", &self.routes.load().len())
            .finish()
    }
}
