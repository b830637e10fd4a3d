//! Registry health ticker.
//!
//! Reads the shared registry every monitor interval and publishes
//! `ro_instances_connected` and `ro_instance_cpu{host}`. Every node in the
//! fleet reports the same shared view.

use crate::observability::metrics;
use crate::registry::InstanceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[instrument(skip_all, name = "ro.task.registry_gauges")]
pub async fn start_registry_gauges(
    registry: Arc<InstanceRegistry>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.peek().await {
                    Ok(snapshot) => {
                        metrics::set_instances_connected(snapshot.connected_count());
                        for instance in snapshot.instances() {
                            metrics::set_instance_cpu(&instance.host, instance.cpu);
                        }
                    }
                    Err(e) => {
                        warn!(target: "ro.registry", error = %e, "Registry gauge refresh failed");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "ro.registry", "Registry gauge task received shutdown signal, exiting");
                break;
            }
        }
    }
}
