//! Load balancing strategies by name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::FactoryRef;
use crate::error::{ProxyError, Result};
use crate::load_balancer::{
    ActiveOrigins, BusyConnectionsStrategy, LoadBalancer, PowerOfTwoStrategy, RoundRobinStrategy,
};

/// Name of [`BusyConnectionsStrategy`].
pub const BUSY_CONNECTIONS: &str = "busy-connections";
/// Name of [`RoundRobinStrategy`].
pub const ROUND_ROBIN: &str = "round-robin";
/// Name of [`PowerOfTwoStrategy`].
pub const POWER_OF_TWO: &str = "power-of-two";

/// Builds a strategy from its configuration block and the origins it balances over.
pub type LoadBalancerFactory = Arc<
    dyn Fn(&serde_json::Value, Arc<dyn ActiveOrigins>) -> Result<Arc<dyn LoadBalancer>> + Send + Sync,
>;

/// Strategy factories keyed by name.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: DashMap<String, LoadBalancerFactory>,
}

impl StrategyRegistry {
    /// A registry without any factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in strategies.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(BUSY_CONNECTIONS, |_, active| {
            Ok(Arc::new(BusyConnectionsStrategy::new(active)) as Arc<dyn LoadBalancer>)
        });
        registry.register(ROUND_ROBIN, |_, active| {
            Ok(Arc::new(RoundRobinStrategy::new(active)) as Arc<dyn LoadBalancer>)
        });
        registry.register(POWER_OF_TWO, |_, active| {
            Ok(Arc::new(PowerOfTwoStrategy::new(active)) as Arc<dyn LoadBalancer>)
        });
        registry
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value, Arc<dyn ActiveOrigins>) -> Result<Arc<dyn LoadBalancer>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the strategy `reference` names.
    pub fn create(
        &self,
        reference: &FactoryRef,
        active: Arc<dyn ActiveOrigins>,
    ) -> Result<Arc<dyn LoadBalancer>> {
        let factory = self
            .factories
            .get(&reference.factory)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ProxyError::Configuration(format!(
                    "no load balancing strategy named '{}'",
                    reference.factory
                ))
            })?;
        factory(&reference.config, active)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("StrategyRegistry").field("factories", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::testing::{active, host};
    use crate::load_balancer::Preferences;

    #[test]
    fn builtins_are_registered() {
        let registry = StrategyRegistry::with_builtins();
        for name in [BUSY_CONNECTIONS, ROUND_ROBIN, POWER_OF_TWO] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn creates_named_strategy() {
        let registry = StrategyRegistry::with_builtins();
        let lb = registry
            .create(&FactoryRef::named(ROUND_ROBIN), active(vec![host("a", 0), host("b", 0)]))
            .unwrap();

        assert_eq!(lb.choose(&Preferences::default()).unwrap().id().as_str(), "a");
        assert_eq!(lb.choose(&Preferences::default()).unwrap().id().as_str(), "b");
    }

    #[test]
    fn unknown_name_is_a_configuration_error() {
        let registry = StrategyRegistry::with_builtins();
        let err = registry
            .create(&FactoryRef::named("fastest"), active(Vec::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }
}
