//! Vortex routing core.
//!
//! The control-plane half of the Vortex reverse proxy:
//!
//! - [`store`]: the versioned routing registry and its coalescing change notifications.
//! - [`routing`]: routing objects, their registry records and in-flight request metrics.
//! - [`load_balancer`]: origin selection strategies and their decorators.
//! - [`retry`]: retry policies.
//! - [`domain`]: backend service declarations.

pub mod config;
pub mod domain;
pub mod error;
pub mod load_balancer;
pub mod metrics;
pub mod retry;
pub mod routing;
pub mod store;

pub use config::{DispatchConfig, FactoryRef};
pub use domain::backend::{
    BackendService, ConnectionPoolSettings, HealthCheckConfig, StickySessionConfig, TlsSettings,
};
pub use domain::origin::{Origin, OriginId};
pub use domain::rewrite::{RewriteRule, RewriteRuleset};
pub use error::{ProxyError, Result};
pub use routing::{HttpHandler, HttpRequest, HttpResponse, ResponseFuture, RoutingObject, RoutingObjectRecord};
pub use store::{IndexedSnapshot, ObjectStore, RoutingStore};
