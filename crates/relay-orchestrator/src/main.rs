//! Relay Orchestrator
//!
//! Signaling-side orchestration service for a media relay fleet.
//!
//! # Servers
//!
//! - HTTP server for health endpoints and Prometheus metrics
//!   (default: 0.0.0.0:8082)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to the shared Redis store
//! 4. Seed the instance registry from the configured fleet
//! 5. Start per-instance monitors (telemetry + event link)
//! 6. Start the stream reaper, stream-list broadcaster and registry gauges
//! 7. Start health HTTP server (liveness, readiness, metrics)
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::secret::ExposeSecret;
use relay_orchestrator::config::Config;
use relay_orchestrator::notify::Notifier;
use relay_orchestrator::observability::{health_router, init_metrics_recorder, HealthState};
use relay_orchestrator::orchestrator::RelayOrchestrator;
use relay_orchestrator::registry::monitor::{spawn_instance_monitors, TelemetryClient};
use relay_orchestrator::registry::{InstanceRegistry, RelayInstance};
use relay_orchestrator::relay::{HttpRelayClient, RelayClient};
use relay_orchestrator::store::redis::LockRetryPolicy;
use relay_orchestrator::store::{DistributedLock, RedisStore, SharedStore};
use relay_orchestrator::streams::StreamCoordinator;
use relay_orchestrator::tasks::{
    start_registry_gauges, start_stream_list_broadcaster, start_stream_reaper,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for background tasks after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_orchestrator=debug,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Relay Orchestrator");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instances = config.relay_instances.len(),
        enabled = config.enabled_instances().count(),
        health_bind_address = %config.health_bind_address,
        monitor_interval_secs = config.monitor_interval.as_secs(),
        reaper_interval_secs = config.reaper_interval.as_secs(),
        json_logs = config.json_logs,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to Redis...");
    let redis = RedisStore::connect(
        config.redis_url.expose_secret(),
        LockRetryPolicy {
            retry_count: config.lock_retry_count,
            retry_delay: config.lock_retry_delay,
            retry_jitter: config.lock_retry_jitter,
        },
    )
    .await?;
    let redis = Arc::new(redis);
    let store: Arc<dyn SharedStore> = redis.clone();
    let lock: Arc<dyn DistributedLock> = redis;
    info!("Redis connection established");

    let registry = Arc::new(InstanceRegistry::new(
        Arc::clone(&store),
        lock,
        config.registry_lock_ttl,
        &config.relay_instances,
    ));
    registry
        .refresh_from_config(&config.relay_instances)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to seed instance registry");
            e
        })?;

    let relay: Arc<dyn RelayClient> = Arc::new(HttpRelayClient::new(
        &config.relay_instances,
        config.relay_request_timeout,
        config.relay_poll_timeout,
    )?);
    let orchestrator = Arc::new(RelayOrchestrator::new(
        Arc::clone(&store),
        relay,
        Arc::clone(&registry),
    ));

    let notifier = Notifier::new();
    let coordinator = Arc::new(StreamCoordinator::new(
        Arc::clone(&store),
        notifier,
        Arc::clone(&registry),
    ));

    let shutdown_token = CancellationToken::new();

    let telemetry = TelemetryClient::new(config.relay_request_timeout)?;
    let monitored: Vec<RelayInstance> = config
        .enabled_instances()
        .map(RelayInstance::from_config)
        .collect();
    let monitor_handles = spawn_instance_monitors(
        Arc::clone(&registry),
        telemetry,
        monitored,
        config.monitor_interval,
        shutdown_token.child_token(),
    );
    info!(monitors = monitor_handles.len(), "Instance monitors started");

    tokio::spawn(start_stream_reaper(
        Arc::clone(&coordinator),
        config.reaper_interval,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_stream_list_broadcaster(
        Arc::clone(&coordinator),
        config.stream_list_interval,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_registry_gauges(
        Arc::clone(&registry),
        config.monitor_interval,
        shutdown_token.child_token(),
    ));

    // Bind before spawning to fail fast on bind errors
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!("Relay Orchestrator running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    for handle in monitor_handles {
        handle.abort();
    }
    drop(orchestrator);

    info!("Relay Orchestrator shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
