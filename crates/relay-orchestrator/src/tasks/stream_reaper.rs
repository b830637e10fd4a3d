//! Stream reaper background task.
//!
//! Runs [`StreamCoordinator::reap`] every reaper interval. A failed cycle is
//! logged and the next tick tries again.
//!
//! # Graceful Shutdown
//!
//! The task exits when the cancellation token is triggered. An in-flight
//! cycle finishes first.

use crate::streams::StreamCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

#[instrument(skip_all, name = "ro.task.stream_reaper")]
pub async fn start_stream_reaper(
    coordinator: Arc<StreamCoordinator>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "ro.streams.reaper",
        interval_ms = interval.as_millis(),
        "Starting stream reaper task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordinator.reap().await {
                    // Store may recover
                    error!(target: "ro.streams.reaper", error = %e, "Stream reaper cycle failed");
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "ro.streams.reaper", "Stream reaper received shutdown signal, exiting");
                break;
            }
        }
    }

    info!(target: "ro.streams.reaper", "Stream reaper task stopped");
}
