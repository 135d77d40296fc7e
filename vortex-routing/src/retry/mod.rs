//! Retry policies deciding whether a failed request is sent to another origin.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;

use crate::config::FactoryRef;
use crate::domain::origin::OriginId;
use crate::error::{ProxyError, Result};
use crate::load_balancer::{LoadBalancer, Preferences, RemoteHost};

/// Name of the [`RetryNTimes`] factory.
pub const RETRY_N_TIMES: &str = "retry-n-times";
/// Name of the factory for a policy that never retries.
pub const NO_RETRY: &str = "no-retry";

/// What a retry policy knows about the request so far.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Backend service the request is for.
    pub backend_id: String,
    /// Retries already made.
    pub current_retry_count: usize,
    /// Failure of the last attempt.
    pub last_error: Option<ProxyError>,
    /// Origins already attempted, in order.
    pub previous_origins: Vec<OriginId>,
}

/// A retry policy's verdict.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Whether to make another attempt.
    pub should_retry: bool,
    /// Where to send it, if anywhere is left.
    pub next_origin: Option<RemoteHost>,
}

/// Decides whether and where a failed request is retried.
pub trait RetryPolicy: Send + Sync {
    /// Evaluate a failed attempt.
    fn evaluate(
        &self,
        context: &RetryContext,
        load_balancer: &dyn LoadBalancer,
        preferences: &Preferences,
    ) -> Outcome;
}

/// Retries retryable failures up to `max_attempts` times, each time on an origin not
/// attempted before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryNTimes {
    max_attempts: usize,
}

impl RetryNTimes {
    /// Allow up to `max_attempts` retries.
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }

    /// Number of retries allowed.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl RetryPolicy for RetryNTimes {
    fn evaluate(
        &self,
        context: &RetryContext,
        load_balancer: &dyn LoadBalancer,
        preferences: &Preferences,
    ) -> Outcome {
        let retryable = context
            .last_error
            .as_ref()
            .map_or(true, ProxyError::is_retryable);

        let preferences = preferences
            .clone()
            .avoiding(context.previous_origins.iter().cloned());
        let next_origin = load_balancer
            .choose(&preferences)
            .filter(|host| !context.previous_origins.contains(host.id()));

        Outcome {
            should_retry: context.current_retry_count < self.max_attempts && retryable,
            next_origin,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetryNTimesConfig {
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    1
}

/// Builds a retry policy from its configuration block.
pub type RetryPolicyFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn RetryPolicy>> + Send + Sync>;

/// Retry policy factories keyed by name.
#[derive(Default)]
pub struct RetryPolicyRegistry {
    factories: DashMap<String, RetryPolicyFactory>,
}

impl RetryPolicyRegistry {
    /// A registry without any factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `retry-n-times` (config `{"count": n}`, default 1) and
    /// `no-retry`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(RETRY_N_TIMES, |config| {
            let config: RetryNTimesConfig = if config.is_null() {
                RetryNTimesConfig { count: default_count() }
            } else {
                serde_json::from_value(config.clone())
                    .map_err(|e| ProxyError::Configuration(format!("{RETRY_N_TIMES}: {e}")))?
            };
            Ok(Arc::new(RetryNTimes::new(config.count)) as Arc<dyn RetryPolicy>)
        });
        registry.register(NO_RETRY, |_| {
            Ok(Arc::new(RetryNTimes::new(0)) as Arc<dyn RetryPolicy>)
        });
        registry
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn RetryPolicy>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the policy `reference` names.
    pub fn create(&self, reference: &FactoryRef) -> Result<Arc<dyn RetryPolicy>> {
        let factory = self
            .factories
            .get(&reference.factory)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ProxyError::Configuration(format!("no retry policy named '{}'", reference.factory))
            })?;
        factory(&reference.config)
    }
}

impl std::fmt::Debug for RetryPolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}
