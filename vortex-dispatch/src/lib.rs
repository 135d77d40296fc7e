//! Vortex backend dispatch.
//!
//! The data-plane half of the Vortex reverse proxy. A [`BackendService`]
//! declaration becomes a [`BackendServiceProxy`]: an [`OriginsInventory`] of
//! pooled origin connections, an optional health prober, and a
//! [`BackendServiceClient`] that load balances, retries and pins sessions.
//! [`BackendServicesRouter`] keeps one such chain per service in the routing
//! registry.
//!
//! [`BackendService`]: vortex_routing::BackendService

pub mod backends;
pub mod client;
pub mod connection_pool;
pub mod factory;
pub mod health_check;
pub mod host_client;
pub mod inventory;
pub mod origin_stats;
pub mod routing_objects;
pub mod tls;

pub use backends::BackendServicesRouter;
pub use client::{BackendServiceClient, BackendServiceClientBuilder, MAX_RETRY_ATTEMPTS};
pub use factory::BackendServiceClientFactory;
pub use inventory::{OriginState, OriginsInventory};
pub use origin_stats::{OriginStats, OriginStatsFactory};
pub use routing_objects::{BackendServiceProxy, LoadBalancingGroup, LoadBalancingGroupConfig};
