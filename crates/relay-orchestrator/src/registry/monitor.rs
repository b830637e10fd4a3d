//! Per-instance health monitors.
//!
//! Each relay instance gets two background loops:
//!
//! - telemetry: samples `{"loadAverage": f}` immediately and then every
//!   monitor interval, storing `cpu = round(100 * loadAverage)`
//! - event link: holds a WebSocket to the relay's event endpoint. Connect
//!   marks the instance connected; close marks it down and clears every pin
//!   to it. Reconnects are attempted every monitor interval while the
//!   registry shows the instance disconnected.
//!
//! Both loops exit on the cancellation token.

use super::{InstanceRegistry, RelayInstance};
use crate::errors::OrchestratorError;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// WebSocket subprotocol spoken by the relay event endpoint.
pub const EVENT_SUBPROTOCOL: &str = "janus-protocol";

/// Delay between bringing up consecutive instances at startup.
const PREPARE_STAGGER: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetrySample {
    load_average: f64,
}

/// Load as stored in the registry.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn cpu_from_load_average(load_average: f64) -> u64 {
    (load_average * 100.0).round().max(0.0) as u64
}

/// HTTP client for relay telemetry endpoints.
#[derive(Clone)]
pub struct TelemetryClient {
    client: reqwest::Client,
}

impl TelemetryClient {
    /// # Errors
    ///
    /// `Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("telemetry client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetch one load sample and convert it to `cpu`.
    pub async fn sample(&self, url: &str) -> Result<u64, OrchestratorError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OrchestratorError::RelayUnavailable(format!("telemetry: {e}")))?;

        let sample: TelemetrySample = response
            .json()
            .await
            .map_err(|e| OrchestratorError::RelayProtocol(format!("telemetry sample: {e}")))?;

        Ok(cpu_from_load_average(sample.load_average))
    }
}

/// Bring up monitors for every instance, staggered by 500ms.
pub fn spawn_instance_monitors(
    registry: Arc<InstanceRegistry>,
    telemetry: TelemetryClient,
    instances: Vec<RelayInstance>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(instances.len());
    let mut stagger = Duration::ZERO;

    for instance in instances {
        let registry = Arc::clone(&registry);
        let telemetry = telemetry.clone();
        let cancel_token = cancel_token.clone();
        let delay = stagger;
        stagger += PREPARE_STAGGER;

        handles.push(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel_token.cancelled() => return,
            }
            prepare_instance(registry, telemetry, instance, interval, cancel_token).await;
        }));
    }

    handles
}

/// Reset the instance's health, then run its telemetry and event-link loops
/// until cancelled.
#[instrument(skip_all, fields(host = %instance.host))]
pub async fn prepare_instance(
    registry: Arc<InstanceRegistry>,
    telemetry: TelemetryClient,
    instance: RelayInstance,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    if let Err(e) = registry.reset_health(&instance.host).await {
        warn!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Failed to reset instance health");
    }

    tokio::join!(
        run_telemetry(
            Arc::clone(&registry),
            telemetry,
            instance.clone(),
            interval,
            cancel_token.clone(),
        ),
        run_event_link(registry, instance, interval, cancel_token),
    );
}

/// Sample load now and every `interval`. Failures keep the last value.
pub async fn run_telemetry(
    registry: Arc<InstanceRegistry>,
    telemetry: TelemetryClient,
    instance: RelayInstance,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match telemetry.sample(&instance.telemetry_url).await {
                    Ok(cpu) => {
                        if let Err(e) = registry.set_cpu(&instance.host, cpu).await {
                            warn!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Failed to store load sample");
                        } else {
                            debug!(target: "ro.registry.monitor", host = %instance.host, cpu, "Load sample stored");
                        }
                    }
                    Err(e) => {
                        debug!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Telemetry unavailable");
                    }
                }
            }
            () = cancel_token.cancelled() => break,
        }
    }
}

/// Keep the event link to the relay up.
pub async fn run_event_link(
    registry: Arc<InstanceRegistry>,
    instance: RelayInstance,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut first = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel_token.cancelled() => break,
        }

        // The registry is shared: another process may already hold a live
        // link to this instance.
        if !first && registry_shows_connected(&registry, &instance.host).await {
            continue;
        }
        first = false;

        let stream = match connect_event_stream(&instance.event_url).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Cannot connect to relay event endpoint");
                continue;
            }
        };

        info!(target: "ro.registry.monitor", host = %instance.host, "Relay event link up");
        if let Err(e) = registry.mark_connected(&instance.host).await {
            warn!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Failed to mark instance connected");
        }

        tokio::select! {
            () = hold_until_closed(stream) => {}
            () = cancel_token.cancelled() => break,
        }

        warn!(target: "ro.registry.monitor", host = %instance.host, "Relay event link down");
        if let Err(e) = registry.handle_instance_down(&instance.host).await {
            warn!(target: "ro.registry.monitor", host = %instance.host, error = %e, "Failed to process instance failure");
        }
    }

    debug!(target: "ro.registry.monitor", host = %instance.host, "Event link loop stopped");
}

async fn registry_shows_connected(registry: &InstanceRegistry, host: &str) -> bool {
    match registry.peek().await {
        Ok(snapshot) => snapshot.get(host).is_some_and(|i| i.connected),
        Err(_) => false,
    }
}

type EventStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_event_stream(url: &str) -> Result<EventStream, OrchestratorError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| OrchestratorError::Config(format!("event url {url}: {e}")))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(EVENT_SUBPROTOCOL),
    );

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| OrchestratorError::RelayUnavailable(format!("event link: {e}")))?;
    Ok(stream)
}

async fn hold_until_closed(mut stream: EventStream) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cpu_from_load_average() {
        assert_eq!(cpu_from_load_average(0.0), 0);
        assert_eq!(cpu_from_load_average(0.424), 42);
        assert_eq!(cpu_from_load_average(1.25), 125);
        assert_eq!(cpu_from_load_average(3.5), 350);
        assert_eq!(cpu_from_load_average(-1.0), 0);
    }

    #[tokio::test]
    async fn test_sample_reads_load_average() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/load"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"loadAverage": 0.75})),
            )
            .mount(&server)
            .await;

        let client = TelemetryClient::new(Duration::from_secs(2)).unwrap();
        let cpu = client.sample(&format!("{}/load", server.uri())).await.unwrap();
        assert_eq!(cpu, 75);
    }

    #[tokio::test]
    async fn test_sample_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbled"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = TelemetryClient::new(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.sample(&format!("{}/down", server.uri())).await,
            Err(OrchestratorError::RelayUnavailable(_))
        ));
        assert!(matches!(
            client.sample(&format!("{}/garbled", server.uri())).await,
            Err(OrchestratorError::RelayProtocol(_))
        ));
    }
}
