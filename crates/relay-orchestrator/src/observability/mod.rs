//! Observability for the relay orchestrator.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Relay secrets and store URLs are never recorded.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `ro_instance_selection_total` | Counter | `outcome` | How rooms were placed |
//! | `ro_selection_fallback_total` | Counter | `reason` | Degraded random placements (alert on this) |
//! | `ro_registry_lock_duration_seconds` | Histogram | none | Wait for `instance-registry-lock` |
//! | `ro_instance_cpu` | Gauge | `host` | Last reported relay load |
//! | `ro_instances_connected` | Gauge | none | Relays with a live event stream |
//! | `ro_relay_request_duration_seconds` | Histogram | `operation` | Control-channel latency |
//! | `ro_relay_errors_total` | Counter | `operation` | Failed control-channel calls |
//! | `ro_connection_failover_total` | Counter | none | Instances marked down during attach |
//! | `ro_session_loops_active` | Gauge | none | Running session event loops |
//! | `ro_session_events_total` | Counter | `kind` | Dispatched relay events |
//! | `ro_streams_reaped_total` | Counter | `reason` | Reaper removals |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
