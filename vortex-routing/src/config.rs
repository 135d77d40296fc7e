//! Dispatch-wide configuration.
//!
//! Parsing configuration files is left to the loader; these types only define the
//! shape and defaults it deserializes into.

use serde::{Deserialize, Serialize};

/// Header carrying the id of the origin that served a response.
pub const DEFAULT_ORIGIN_ID_HEADER: &str = "X-Origin-Id";

/// Names a factory and the configuration block handed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryRef {
    /// Registered factory name.
    pub factory: String,
    /// Free-form factory configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl FactoryRef {
    /// Reference a factory without configuration.
    pub fn named(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            config: serde_json::Value::Null,
        }
    }
}

/// Settings shared by every backend service dispatch chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    /// Retry policy for services that do not declare one.
    pub retry_policy: Option<FactoryRef>,
    /// Load balancing strategy for services that do not declare one.
    pub load_balancer: Option<FactoryRef>,
    /// Origin restriction cookie for services that do not declare one.
    pub origin_restriction_cookie: Option<String>,
    /// Response header naming the origin that served a request.
    pub origin_id_header: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_policy: None,
            load_balancer: None,
            origin_restriction_cookie: None,
            origin_id_header: DEFAULT_ORIGIN_ID_HEADER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: DispatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.origin_id_header, "X-Origin-Id");
    }

    #[test]
    fn reads_factory_references() {
        let config: DispatchConfig = serde_json::from_value(serde_json::json!({
            "retryPolicy": { "factory": "retry-n-times", "config": { "count": 2 } },
            "loadBalancer": { "factory": "round-robin" },
            "originRestrictionCookie": "originRestrict"
        }))
        .unwrap();

        assert_eq!(config.retry_policy.unwrap().config["count"], 2);
        assert_eq!(config.load_balancer, Some(FactoryRef::named("round-robin")));
        assert_eq!(config.origin_restriction_cookie.as_deref(), Some("originRestrict"));
    }
}
