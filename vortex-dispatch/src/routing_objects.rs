//! Routing objects backed by the dispatch pipeline.
//!
//! [`BackendServiceProxy`] serves one backend service through its own origins
//! inventory. [`LoadBalancingGroup`] balances over other routing objects in the
//! registry, picked by their `lbGroup=<name>` tag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vortex_routing::config::FactoryRef;
use vortex_routing::load_balancer::strategy::POWER_OF_TWO;
use vortex_routing::load_balancer::{
    ActiveOriginSet, ActiveOrigins, DecoratedLoadBalancer, LoadBalancer, OriginsSnapshot,
    PowerOfTwoStrategy, RemoteHost,
};
use vortex_routing::routing::record::lb_group_tag;
use vortex_routing::store::Subscription;
use vortex_routing::{
    BackendService, HttpHandler, HttpRequest, IndexedSnapshot, Origin, ProxyError, ResponseFuture,
    Result, RoutingObject, RoutingObjectRecord, RoutingStore, StickySessionConfig,
};

use crate::client::BackendServiceClient;
use crate::connection_pool::HttpConnectionPoolFactory;
use crate::factory::BackendServiceClientFactory;
use crate::health_check::spawn_health_checker;
use crate::inventory::OriginsInventory;
use crate::origin_stats::OriginStatsFactory;

/// Routing object type name of [`BackendServiceProxy`] records.
pub const BACKEND_SERVICE_PROXY: &str = "BackendServiceProxy";
/// Routing object type name of [`LoadBalancingGroup`] records.
pub const LOAD_BALANCING_GROUP: &str = "LoadBalancingGroup";

/// Serves one backend service.
///
/// Stopping it detaches the client's load balancer from the inventory, stops
/// health checks and closes every origin's connection pool.
pub struct BackendServiceProxy {
    client: BackendServiceClient,
    inventory: Arc<OriginsInventory>,
    health_checker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BackendServiceProxy {
    /// Wrap an already built client and the inventory it balances over.
    pub fn new(
        client: BackendServiceClient,
        inventory: Arc<OriginsInventory>,
        health_checker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            client,
            inventory,
            health_checker: Mutex::new(health_checker),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build the full chain of `service`: connection pools, inventory, health
    /// checks when configured, and the client.
    ///
    /// Health checks run on the current Tokio runtime.
    pub fn create(service: &BackendService, factory: &BackendServiceClientFactory) -> Result<Self> {
        service.validate()?;

        let pools = HttpConnectionPoolFactory::for_service(service)?.with_metrics(factory.metrics().clone());
        let inventory = Arc::new(OriginsInventory::new(service.id.clone(), Arc::new(pools)));
        inventory.set_origins(service.app_origins());

        let client = match factory.create_client(
            service,
            Arc::clone(&inventory),
            OriginStatsFactory::new(factory.metrics().clone()),
        ) {
            Ok(client) => client,
            Err(e) => {
                inventory.close();
                return Err(e);
            }
        };

        let health_checker = service
            .health_check
            .as_ref()
            .map(|config| spawn_health_checker(&inventory, config));

        Ok(Self::new(client, inventory, health_checker))
    }

    /// The backend service client.
    pub fn client(&self) -> &BackendServiceClient {
        &self.client
    }

    /// The origins this proxy balances over.
    pub fn inventory(&self) -> &Arc<OriginsInventory> {
        &self.inventory
    }

    /// Whether [`stop`](RoutingObject::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl HttpHandler for BackendServiceProxy {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        if self.is_stopped() {
            let id = self.client.id().to_string();
            return Box::pin(async move { Err(ProxyError::ObjectStopped(id)) });
        }
        self.client.send(request)
    }
}

impl RoutingObject for BackendServiceProxy {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(backend = %self.client.id(), "stopping backend service proxy");
        self.client.detach_listener();
        if let Some(checker) = self.health_checker.lock().take() {
            checker.abort();
        }
        self.inventory.close();
    }
}

impl std::fmt::Debug for BackendServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendServiceProxy")
            .field("client", &self.client)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Configuration of a [`LoadBalancingGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingGroupConfig {
    /// Group name: members carry the tag `lbGroup=<origins>`.
    pub origins: String,
    /// Balancing strategy. Defaults to power of two choices.
    #[serde(default)]
    pub strategy: Option<FactoryRef>,
    /// Cookie carrying origin restriction patterns over member names.
    #[serde(default)]
    pub origins_restriction_cookie: Option<String>,
    /// Sticky session settings.
    #[serde(default)]
    pub sticky_session: Option<StickySessionConfig>,
}

impl LoadBalancingGroupConfig {
    /// Read the configuration block of a routing object record.
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(config.clone())
            .map_err(|e| ProxyError::Configuration(format!("{LOAD_BALANCING_GROUP}: {e}")))
    }
}

/// Balances requests over the routing objects tagged `lbGroup=<name>`.
///
/// Membership follows the registry: the group watches it and rebuilds its member
/// list on every change. A member's load is its number of ongoing requests.
pub struct LoadBalancingGroup {
    name: String,
    client: BackendServiceClient,
    members: Arc<ActiveOriginSet>,
    subscription: Mutex<Option<Subscription<RoutingObjectRecord>>>,
}

impl LoadBalancingGroup {
    /// Create a group watching `store`.
    pub fn new(
        config: LoadBalancingGroupConfig,
        store: &RoutingStore<RoutingObjectRecord>,
        factory: &BackendServiceClientFactory,
    ) -> Result<Self> {
        let name = config.origins.clone();
        if name.trim().is_empty() {
            return Err(ProxyError::Configuration(format!("{LOAD_BALANCING_GROUP} has no origins group")));
        }

        let members = Arc::new(ActiveOriginSet::default());
        let active: Arc<dyn ActiveOrigins> = members.clone();
        let base = Self::strategy(&config, factory, Arc::clone(&active));

        let sticky_session = config.sticky_session.clone().unwrap_or_default();
        let load_balancer = DecoratedLoadBalancer::decorate(
            &name,
            Arc::clone(&base),
            active,
            sticky_session.enabled,
            config.origins_restriction_cookie.as_deref(),
        );
        let client = BackendServiceClient::builder(&name)
            .origin_restriction_cookie(config.origins_restriction_cookie.clone())
            .sticky_session(sticky_session)
            .origin_id_header(&factory.config().origin_id_header)
            .load_balancer(Arc::new(load_balancer))
            .metrics(factory.metrics().clone())
            .build()?;

        let membership = Membership {
            group: name.clone(),
            tag: lb_group_tag(&name),
            members: Arc::clone(&members),
            balancer: base,
        };
        membership.refresh(&store.snapshot());
        let subscription = store.subscribe(move |snapshot| membership.refresh(snapshot));

        Ok(Self {
            name,
            client,
            members,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    fn strategy(
        config: &LoadBalancingGroupConfig,
        factory: &BackendServiceClientFactory,
        active: Arc<dyn ActiveOrigins>,
    ) -> Arc<dyn LoadBalancer> {
        let reference = config
            .strategy
            .clone()
            .unwrap_or_else(|| FactoryRef::named(POWER_OF_TWO));
        factory
            .strategies()
            .create(&reference, Arc::clone(&active))
            .unwrap_or_else(|e| {
                warn!(group = %config.origins, error = %e, "could not create load balancer, using {POWER_OF_TWO}");
                Arc::new(PowerOfTwoStrategy::new(active))
            })
    }

    /// The group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the routing objects currently in the group.
    pub fn members(&self) -> Vec<String> {
        self.members
            .snapshot()
            .iter()
            .map(|host| host.id().to_string())
            .collect()
    }

    /// The client dispatching to group members.
    pub fn client(&self) -> &BackendServiceClient {
        &self.client
    }
}

impl HttpHandler for LoadBalancingGroup {
    fn handle(&self, request: HttpRequest) -> ResponseFuture {
        self.client.send(request)
    }
}

impl RoutingObject for LoadBalancingGroup {
    fn stop(&self) {
        if self.subscription.lock().take().is_some() {
            info!(group = %self.name, "stopped watching group members");
        }
    }
}

impl std::fmt::Debug for LoadBalancingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancingGroup")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish()
    }
}

struct Membership {
    group: String,
    tag: String,
    members: Arc<ActiveOriginSet>,
    balancer: Arc<dyn LoadBalancer>,
}

impl Membership {
    fn refresh(&self, snapshot: &IndexedSnapshot<RoutingObjectRecord>) {
        let hosts: Vec<RemoteHost> = snapshot
            .entries()
            .iter()
            .filter(|(_, record)| record.has_tag(&self.tag) && !record.is_stopped())
            .map(|(name, record)| {
                RemoteHost::new(
                    Origin::new(self.group.clone(), name.as_str(), "", 0),
                    Arc::clone(record.routing_object()),
                )
            })
            .collect();

        let active: Vec<Origin> = hosts.iter().map(|host| host.origin().clone()).collect();
        let changed = {
            let current = self.members.snapshot();
            current.len() != active.len() || current.iter().zip(&active).any(|(host, origin)| host.origin() != origin)
        };
        self.members.update(hosts);

        if changed {
            debug!(group = %self.group, index = snapshot.index(), members = active.len(), "group members changed");
            self.balancer.origins_changed(&OriginsSnapshot {
                app_id: self.group.clone(),
                active,
                ..OriginsSnapshot::default()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use vortex_routing::metrics::MetricRegistry;
    use vortex_routing::DispatchConfig;

    /// Answers every request with its own name.
    struct Named(&'static str);

    impl HttpHandler for Named {
        fn handle(&self, _request: HttpRequest) -> ResponseFuture {
            let name = self.0;
            Box::pin(async move { Ok(http::Response::new(Bytes::from_static(name.as_bytes()))) })
        }
    }

    impl RoutingObject for Named {}

    fn member(name: &'static str, group: &str) -> RoutingObjectRecord {
        RoutingObjectRecord::create("StaticResponse", [lb_group_tag(group)], serde_json::Value::Null, Arc::new(Named(name)))
    }

    fn factory() -> BackendServiceClientFactory {
        BackendServiceClientFactory::new(DispatchConfig::default(), MetricRegistry::new())
    }

    fn config(value: serde_json::Value) -> LoadBalancingGroupConfig {
        LoadBalancingGroupConfig::from_json(&value).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn get() -> HttpRequest {
        http::Request::builder().uri("/").body(Bytes::new()).unwrap()
    }

    #[test]
    fn reads_group_config() {
        let config = config(serde_json::json!({
            "origins": "shop",
            "strategy": { "factory": "round-robin" },
            "originsRestrictionCookie": "restrict",
            "stickySession": { "enabled": true, "timeoutSeconds": 60 }
        }));

        assert_eq!(config.origins, "shop");
        assert_eq!(config.strategy, Some(FactoryRef::named("round-robin")));
        assert_eq!(config.sticky_session, Some(StickySessionConfig::enabled(60)));
    }

    #[test]
    fn group_name_is_required() {
        assert!(LoadBalancingGroupConfig::from_json(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn members_follow_the_registry() {
        let store = RoutingStore::new();
        store.insert("shop-01", member("shop-01", "shop"));
        store.insert("other", member("other", "elsewhere"));

        let group = LoadBalancingGroup::new(config(serde_json::json!({ "origins": "shop" })), &store, &factory()).unwrap();
        assert_eq!(group.members(), vec!["shop-01".to_string()]);

        store.insert("shop-02", member("shop-02", "shop"));
        eventually(|| group.members().len() == 2).await;

        store.remove("shop-01");
        eventually(|| group.members() == vec!["shop-02".to_string()]).await;

        let response = group.handle(get()).await.unwrap();
        assert_eq!(response.body().as_ref(), b"shop-02");
        assert_eq!(response.headers()["X-Origin-Id"], "shop-02");
    }

    #[tokio::test]
    async fn stopped_group_no_longer_watches() {
        let store = RoutingStore::new();
        let group = LoadBalancingGroup::new(config(serde_json::json!({ "origins": "shop" })), &store, &factory()).unwrap();
        eventually(|| store.watchers() == 1).await;

        group.stop();

        assert_eq!(store.watchers(), 0);
        store.insert("shop-01", member("shop-01", "shop"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(group.members().is_empty());
    }

    #[tokio::test]
    async fn empty_group_has_no_hosts() {
        let store = RoutingStore::new();
        let group = LoadBalancingGroup::new(config(serde_json::json!({ "origins": "shop" })), &store, &factory()).unwrap();

        let error = group.handle(get()).await.unwrap_err();

        assert_eq!(error, ProxyError::NoAvailableHosts { backend: "shop".into() });
    }

    #[tokio::test]
    async fn stopped_proxy_refuses_requests() {
        let service = BackendService::new("shop", vec![Origin::new("shop", "shop-01", "localhost", 9)]);
        let proxy = BackendServiceProxy::create(&service, &factory()).unwrap();
        assert_eq!(proxy.inventory().listener_count(), 1);

        proxy.stop();
        proxy.stop();

        assert!(proxy.inventory().is_closed());
        assert_eq!(proxy.inventory().listener_count(), 0);
        let error = proxy.handle(get()).await.unwrap_err();
        assert_eq!(error, ProxyError::ObjectStopped("shop".into()));
    }
}
