//! Backend service declarations.
//!
//! A [`BackendService`] is what the configuration loader hands over for each
//! application: the origins it is served by, and the knobs that decide how a
//! dispatch chain is assembled for it.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::FactoryRef;
use crate::domain::origin::Origin;
use crate::domain::rewrite::{self, RewriteRule};
use crate::error::{ProxyError, Result};

/// Sticky session settings of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StickySessionConfig {
    /// Whether clients are pinned to the origin that first served them.
    pub enabled: bool,
    /// Lifetime of the sticky session cookie.
    pub timeout_seconds: u64,
}

impl StickySessionConfig {
    /// Sticky sessions switched off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sticky sessions switched on with the given cookie lifetime.
    pub fn enabled(timeout_seconds: u64) -> Self {
        Self {
            enabled: true,
            timeout_seconds,
        }
    }
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: 43_200,
        }
    }
}

/// Per-origin connection pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPoolSettings {
    /// Upper bound of connections borrowed or being established at once.
    pub max_connections_per_host: usize,
    /// Upper bound of borrowers waiting for a connection.
    pub max_pending_connections_per_host: usize,
    /// How long a borrower waits for a connection, in milliseconds.
    pub connect_timeout_millis: u64,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_connections_per_host: 300,
            max_pending_connections_per_host: 300,
            connect_timeout_millis: 2_000,
        }
    }
}

/// Active health checking of the origins of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    /// Time between two probes of the same origin, in milliseconds.
    pub interval_millis: u64,
    /// How long a probe may take before the origin counts as down, in milliseconds.
    pub timeout_millis: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_millis: 5_000,
            timeout_millis: 1_500,
        }
    }
}

/// TLS settings for connections to the origins of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    /// PEM bundle of the certificate authorities origin certificates are checked against.
    pub trusted_certificates: PathBuf,
    /// Server name sent in the handshake; the origin host when absent.
    #[serde(default)]
    pub sni_host: Option<String>,
}

/// A backend service declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    /// Backend service id. Also used as the application id of its origins.
    pub id: String,
    /// Path prefix of the requests this service receives.
    #[serde(default = "root_path")]
    pub path: String,
    /// The origins serving this application.
    pub origins: Vec<Origin>,
    /// Retry policy to use; falls back to the dispatch-wide default.
    #[serde(default)]
    pub retry_policy: Option<FactoryRef>,
    /// Load balancing strategy to use; falls back to the dispatch-wide default.
    #[serde(default)]
    pub load_balancer: Option<FactoryRef>,
    /// Sticky session settings.
    #[serde(default)]
    pub sticky_session: StickySessionConfig,
    /// Cookie that restricts the candidate origins; falls back to the dispatch-wide one.
    #[serde(default)]
    pub origin_restriction_cookie: Option<String>,
    /// URL rewrites applied before dispatch.
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
    /// Replace the `Host` header with the chosen origin's address.
    #[serde(default)]
    pub override_host_header: bool,
    /// Connection pool limits of every origin.
    #[serde(default)]
    pub connection_pool: ConnectionPoolSettings,
    /// Probe origins and take failing ones out of rotation when set.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Talk TLS to the origins when set.
    #[serde(default)]
    pub tls_settings: Option<TlsSettings>,
}

impl BackendService {
    /// A declaration with the given origins and every knob at its default.
    pub fn new(id: impl Into<String>, origins: Vec<Origin>) -> Self {
        Self {
            id: id.into(),
            path: root_path(),
            origins,
            retry_policy: None,
            load_balancer: None,
            sticky_session: StickySessionConfig::default(),
            origin_restriction_cookie: None,
            rewrites: Vec::new(),
            override_host_header: false,
            connection_pool: ConnectionPoolSettings::default(),
            health_check: None,
            tls_settings: None,
        }
    }

    /// Checks the declaration is complete enough to build a dispatch chain.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(malformed("backend service id is empty"));
        }
        if !self.path.starts_with('/') {
            return Err(malformed(format!(
                "backend service '{}' path '{}' does not start with '/'",
                self.id, self.path
            )));
        }
        if self.origins.is_empty() {
            return Err(malformed(format!("backend service '{}' has no origins", self.id)));
        }

        let mut seen = HashSet::new();
        for origin in &self.origins {
            if origin.id.as_str().trim().is_empty() {
                return Err(malformed(format!("backend service '{}' has an origin without id", self.id)));
            }
            if origin.host.trim().is_empty() || origin.port == 0 {
                return Err(malformed(format!(
                    "origin '{}' of backend service '{}' has no valid address",
                    origin.id, self.id
                )));
            }
            if !seen.insert(&origin.id) {
                return Err(malformed(format!(
                    "origin id '{}' is duplicated in backend service '{}'",
                    origin.id, self.id
                )));
            }
        }

        if self.connection_pool.max_connections_per_host == 0 {
            return Err(malformed(format!(
                "backend service '{}' allows no connections per host",
                self.id
            )));
        }

        rewrite::validate(&self.rewrites)
    }

    /// The origins, each tagged with this service's id as application id.
    pub fn app_origins(&self) -> Vec<Origin> {
        self.origins
            .iter()
            .cloned()
            .map(|mut origin| {
                origin.app_id = self.id.clone();
                origin
            })
            .collect()
    }
}

fn root_path() -> String {
    "/".to_string()
}

fn malformed(message: impl Into<String>) -> ProxyError {
    ProxyError::MalformedBackendService(message.into())
}
