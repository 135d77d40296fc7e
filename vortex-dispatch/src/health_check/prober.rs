//! Background prober for active TCP health checks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use vortex_routing::HealthCheckConfig;

use crate::inventory::{OriginState, OriginsInventory};

/// Probe every non-disabled origin once and report the results to the inventory.
///
/// An origin is healthy when a TCP connection to it opens within `timeout`.
pub async fn probe_origins(inventory: &OriginsInventory, timeout: Duration) {
    for origin in inventory.probe_targets() {
        let healthy = matches!(
            time::timeout(timeout, TcpStream::connect(origin.host_and_port())).await,
            Ok(Ok(_stream))
        );

        debug!(origin = %origin.id, healthy, "health probe finished");
        match (healthy, inventory.origin_state(&origin.id)) {
            (true, Some(OriginState::Inactive)) => inventory.origin_healthy(&origin.id),
            (false, Some(OriginState::Active)) => inventory.origin_unhealthy(&origin.id),
            _ => {}
        }
    }
}

/// Spawns a background Tokio task that probes the inventory's origins every
/// `config.interval_millis`.
///
/// The task ends once the inventory is closed or dropped.
pub fn spawn_health_checker(inventory: &Arc<OriginsInventory>, config: &HealthCheckConfig) -> JoinHandle<()> {
    let inventory: Weak<OriginsInventory> = Arc::downgrade(inventory);
    let check_interval = Duration::from_millis(config.interval_millis.max(1));
    let timeout = Duration::from_millis(config.timeout_millis);

    tokio::spawn(async move {
        let mut interval = time::interval(check_interval);

        // Prevent immediately ticking when spawned
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(inventory) = inventory.upgrade() else {
                break;
            };
            if inventory.is_closed() {
                break;
            }
            probe_origins(&inventory, timeout).await;
        }
    })
}
