//! Builds the dispatch chain of a backend service.

use std::sync::Arc;

use tracing::{info, warn};

use vortex_routing::config::FactoryRef;
use vortex_routing::load_balancer::strategy::BUSY_CONNECTIONS;
use vortex_routing::load_balancer::{
    ActiveOrigins, BusyConnectionsStrategy, DecoratedLoadBalancer, LoadBalancer, LoadBalancerListener,
    StrategyRegistry,
};
use vortex_routing::metrics::MetricRegistry;
use vortex_routing::retry::{RetryNTimes, RetryPolicy, RetryPolicyRegistry};
use vortex_routing::{BackendService, DispatchConfig, Result};

use crate::client::{BackendServiceClient, ListenerRegistration};
use crate::inventory::OriginsInventory;
use crate::origin_stats::OriginStatsFactory;

/// Turns backend service declarations into [`BackendServiceClient`]s.
///
/// Retry policies and load balancers are looked up by name. A name that cannot be
/// resolved is replaced by a default and logged; only a malformed declaration fails.
#[derive(Debug, Clone)]
pub struct BackendServiceClientFactory {
    config: DispatchConfig,
    strategies: Arc<StrategyRegistry>,
    retry_policies: Arc<RetryPolicyRegistry>,
    metrics: MetricRegistry,
}

impl BackendServiceClientFactory {
    /// A factory with the built-in strategies and retry policies.
    pub fn new(config: DispatchConfig, metrics: MetricRegistry) -> Self {
        Self::with_registries(
            config,
            Arc::new(StrategyRegistry::with_builtins()),
            Arc::new(RetryPolicyRegistry::with_builtins()),
            metrics,
        )
    }

    /// A factory resolving names in the given registries.
    pub fn with_registries(
        config: DispatchConfig,
        strategies: Arc<StrategyRegistry>,
        retry_policies: Arc<RetryPolicyRegistry>,
        metrics: MetricRegistry,
    ) -> Self {
        Self {
            config,
            strategies,
            retry_policies,
            metrics,
        }
    }

    /// Dispatch-wide settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The load balancing strategies known to this factory.
    pub fn strategies(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    /// The metric registry handed to every client.
    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    /// Build the client of `service`, balancing over `inventory`.
    ///
    /// The chosen load balancer is registered as a listener on `inventory`; the
    /// client removes it again when detached or dropped.
    pub fn create_client(
        &self,
        service: &BackendService,
        inventory: Arc<OriginsInventory>,
        origin_stats: OriginStatsFactory,
    ) -> Result<BackendServiceClient> {
        service.validate()?;

        let retry_policy = self.retry_policy(service);
        let active: Arc<dyn ActiveOrigins> = inventory.clone();
        let base = self.load_balancer(service, Arc::clone(&active));

        let listener_id = inventory.add_origins_change_listener(Arc::new(LoadBalancerListener(Arc::clone(&base))));
        let registration = ListenerRegistration::new(&inventory, listener_id);

        let restriction_cookie = service
            .origin_restriction_cookie
            .as_ref()
            .or(self.config.origin_restriction_cookie.as_ref())
            .cloned();
        let load_balancer = DecoratedLoadBalancer::decorate(
            &service.id,
            base,
            active,
            service.sticky_session.enabled,
            restriction_cookie.as_deref(),
        );

        BackendServiceClient::builder(&service.id)
            .rewrites(service.rewrites.clone())
            .origin_stats(origin_stats)
            .origin_restriction_cookie(restriction_cookie)
            .sticky_session(service.sticky_session.clone())
            .origin_id_header(&self.config.origin_id_header)
            .load_balancer(Arc::new(load_balancer))
            .retry_policy(retry_policy)
            .metrics(self.metrics.clone())
            .override_host_header(service.override_host_header)
            .listener(registration)
            .build()
    }

    fn retry_policy(&self, service: &BackendService) -> Arc<dyn RetryPolicy> {
        let reference = service.retry_policy.as_ref().or(self.config.retry_policy.as_ref());
        let Some(reference) = reference else {
            warn!(backend = %service.id, "no retry policy configured, retrying once");
            return Arc::new(RetryNTimes::new(1));
        };
        self.retry_policies.create(reference).unwrap_or_else(|e| {
            warn!(
                backend = %service.id,
                policy = %reference.factory,
                error = %e,
                "could not create retry policy, retrying once"
            );
            Arc::new(RetryNTimes::new(1))
        })
    }

    fn load_balancer(&self, service: &BackendService, active: Arc<dyn ActiveOrigins>) -> Arc<dyn LoadBalancer> {
        let reference = service
            .load_balancer
            .as_ref()
            .or(self.config.load_balancer.as_ref())
            .cloned()
            .unwrap_or_else(|| {
                info!(backend = %service.id, strategy = BUSY_CONNECTIONS, "no load balancer configured, using default");
                FactoryRef::named(BUSY_CONNECTIONS)
            });

        match self.strategies.create(&reference, Arc::clone(&active)) {
            Ok(strategy) => strategy,
            Err(e) => {
                info!(
                    backend = %service.id,
                    strategy = %reference.factory,
                    error = %e,
                    "could not create load balancer, using {BUSY_CONNECTIONS}"
                );
                Arc::new(BusyConnectionsStrategy::new(active))
            }
        }
    }
}
