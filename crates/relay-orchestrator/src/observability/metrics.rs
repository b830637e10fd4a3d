//! Metrics definitions for the relay orchestrator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `ro_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: 4 values (cached, sticky, lowest_load, fallback)
//! - `reason`: bounded per metric (2-3 values)
//! - `operation`: bounded by relay request kinds (~14 values)
//! - `kind`: bounded by relay event kinds (~12 values)
//! - `host`: bounded by the configured relay fleet

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Relay control requests - HTTP calls to the relay fleet
        .set_buckets_for_metric(
            Matcher::Prefix("ro_relay_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set relay request buckets: {e}"))?
        // Registry lock wait - bounded by retry_count * (delay + jitter)
        .set_buckets_for_metric(
            Matcher::Prefix("ro_registry_lock".to_string()),
            &[0.001, 0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 5.000, 20.000],
        )
        .map_err(|e| format!("Failed to set registry lock buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Instance Selection
// ============================================================================

/// Record an instance selection.
///
/// Metric: `ro_instance_selection_total`
/// Labels: `outcome` (cached, sticky, lowest_load, fallback)
pub fn record_instance_selection(outcome: &'static str) {
    counter!("ro_instance_selection_total", "outcome" => outcome).increment(1);
}

/// Record a degraded random placement.
///
/// Metric: `ro_selection_fallback_total`
/// Labels: `reason` (no_connected, store_error)
///
/// Any non-zero rate means rooms are being placed without load information.
pub fn record_selection_fallback(reason: &'static str) {
    counter!("ro_selection_fallback_total", "reason" => reason).increment(1);
}

/// Record a lock wait on the instance registry.
///
/// Metric: `ro_registry_lock_duration_seconds`
/// Labels: none
pub fn record_lock_wait(duration: Duration) {
    histogram!("ro_registry_lock_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Relay Instances (Gauges)
// ============================================================================

/// Set the last reported load of a relay instance.
///
/// Metric: `ro_instance_cpu`
/// Labels: `host`
pub fn set_instance_cpu(host: &str, cpu: u64) {
    // cpu values are small integers, no precision loss
    #[allow(clippy::cast_precision_loss)]
    gauge!("ro_instance_cpu", "host" => host.to_string()).set(cpu as f64);
}

/// Set the number of connected relay instances.
///
/// Metric: `ro_instances_connected`
/// Labels: none
pub fn set_instances_connected(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ro_instances_connected").set(count as f64);
}

// ============================================================================
// Relay Control Channel
// ============================================================================

/// Record a relay control request.
///
/// Metrics: `ro_relay_request_duration_seconds`, `ro_relay_errors_total`
/// Labels: `operation`
pub fn record_relay_request(operation: &'static str, duration: Duration, success: bool) {
    histogram!("ro_relay_request_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
    if !success {
        counter!("ro_relay_errors_total", "operation" => operation).increment(1);
    }
}

/// Record an instance being marked down during connection setup.
///
/// Metric: `ro_connection_failover_total`
/// Labels: none
pub fn record_connection_failover() {
    counter!("ro_connection_failover_total").increment(1);
}

// ============================================================================
// Session Event Engine
// ============================================================================

/// Track a session loop starting.
///
/// Metric: `ro_session_loops_active`
pub fn session_loop_started() {
    gauge!("ro_session_loops_active").increment(1.0);
}

/// Track a session loop ending.
///
/// Metric: `ro_session_loops_active`
pub fn session_loop_stopped() {
    gauge!("ro_session_loops_active").decrement(1.0);
}

/// Record a dispatched relay event.
///
/// Metric: `ro_session_events_total`
/// Labels: `kind`
pub fn record_session_event(kind: &'static str) {
    counter!("ro_session_events_total", "kind" => kind).increment(1);
}

// ============================================================================
// Stream Lifecycle
// ============================================================================

/// Record a stream removed or released by the reaper.
///
/// Metric: `ro_streams_reaped_total`
/// Labels: `reason` (no_presenter, presenter_gone, viewer_gone, unreadable)
pub fn record_stream_reaped(reason: &'static str) {
    counter!("ro_streams_reaped_total", "reason" => reason).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_metrics() {
        record_instance_selection("cached");
        record_instance_selection("sticky");
        record_instance_selection("lowest_load");
        record_instance_selection("fallback");
        record_selection_fallback("no_connected");
        record_selection_fallback("store_error");
    }

    #[test]
    fn test_instance_gauges() {
        set_instance_cpu("relay-1", 0);
        set_instance_cpu("relay-1", 100_000);
        set_instances_connected(0);
        set_instances_connected(3);
    }

    #[test]
    fn test_relay_and_session_metrics() {
        record_relay_request("create", Duration::from_millis(12), true);
        record_relay_request("listparticipants", Duration::from_millis(40), false);
        record_connection_failover();
        session_loop_started();
        record_session_event("keepalive");
        session_loop_stopped();
        record_lock_wait(Duration::from_millis(3));
        record_stream_reaped("no_presenter");
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        // Recorders are global state; other tests in this binary may have
        // installed one already, in which case the snapshot is not ours.
        if recorder.install().is_err() {
            return;
        }

        record_instance_selection("lowest_load");
        record_selection_fallback("no_connected");
        set_instance_cpu("relay-1", 42);
        record_relay_request("attach", Duration::from_millis(5), false);
        record_stream_reaped("presenter_gone");

        let metrics = snapshotter.snapshot().into_vec();
        assert!(
            metrics.len() >= 5,
            "expected at least 5 recorded series, got {}",
            metrics.len()
        );
    }
}
