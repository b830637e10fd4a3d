//! Periodic stream-list push to observers.

use crate::streams::StreamCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, name = "ro.task.stream_list_broadcaster")]
pub async fn start_stream_list_broadcaster(
    coordinator: Arc<StreamCoordinator>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "ro.streams",
        interval_ms = interval.as_millis(),
        "Starting stream list broadcaster task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.broadcast_stream_list().await {
                    Ok(0) => {}
                    Ok(observers) => {
                        debug!(target: "ro.streams", observers, "Stream list broadcast");
                    }
                    Err(e) => {
                        warn!(target: "ro.streams", error = %e, "Stream list broadcast failed");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "ro.streams", "Stream list broadcaster received shutdown signal, exiting");
                break;
            }
        }
    }

    info!(target: "ro.streams", "Stream list broadcaster task stopped");
}
