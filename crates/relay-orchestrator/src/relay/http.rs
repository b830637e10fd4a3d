//! HTTP relay client.
//!
//! Control requests are JSON POSTs; the event channel is a long-poll GET on
//! `/janus/{session}`. When an instance has an API secret it is added to
//! POST bodies as `apisecret` and to long-poll GETs as `?apisecret=`.

use super::messages::{RelayRequest, RelayResponse};
use super::RelayClient;
use crate::config::RelayInstanceConfig;
use crate::errors::OrchestratorError;
use crate::observability::metrics;
use crate::registry::RelayInstance;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// reqwest-based [`RelayClient`].
#[derive(Clone)]
pub struct HttpRelayClient {
    /// Control-channel client.
    client: Client,

    /// Long-poll client. The relay holds polls for up to ~30s, so this
    /// timeout is longer than the control timeout.
    poll_client: Client,

    /// host -> API secret.
    secrets: HashMap<String, SecretString>,
}

impl HttpRelayClient {
    /// # Errors
    ///
    /// `Internal` if an HTTP client cannot be built.
    pub fn new(
        instances: &[RelayInstanceConfig],
        request_timeout: Duration,
        poll_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("relay client: {e}")))?;
        let poll_client = Client::builder()
            .timeout(poll_timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("relay poll client: {e}")))?;

        let secrets = instances
            .iter()
            .filter_map(|i| i.secret.clone().map(|s| (i.host.clone(), s)))
            .collect();

        Ok(Self {
            client,
            poll_client,
            secrets,
        })
    }

    fn url(instance: &RelayInstance, path: &str) -> String {
        format!("{}{}", instance.control_url.trim_end_matches('/'), path)
    }

    fn payload(&self, instance: &RelayInstance, request: &RelayRequest) -> Result<Value, OrchestratorError> {
        let mut payload = serde_json::to_value(request)
            .map_err(|e| OrchestratorError::Internal(format!("serialize relay request: {e}")))?;
        if let (Some(secret), Value::Object(map)) =
            (self.secrets.get(&instance.host), &mut payload)
        {
            map.insert(
                "apisecret".to_string(),
                Value::String(secret.expose_secret().to_string()),
            );
        }
        Ok(payload)
    }

    async fn post(
        &self,
        instance: &RelayInstance,
        path: &str,
        request: &RelayRequest,
    ) -> Result<RelayResponse, OrchestratorError> {
        let payload = self.payload(instance, request)?;

        let response = self
            .client
            .post(Self::url(instance, path))
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                OrchestratorError::RelayUnavailable(format!("{} on {}: {e}", request.operation(), instance.host))
            })?;

        let answer: RelayResponse = response.json().await.map_err(|e| {
            OrchestratorError::RelayProtocol(format!("{} answer: {e}", request.operation()))
        })?;

        if answer.janus == "error" {
            let reason = answer
                .error
                .as_ref()
                .and_then(|e| e.reason.clone())
                .unwrap_or_default();
            return Err(OrchestratorError::RelayUnavailable(format!(
                "{} refused by {}: {reason}",
                request.operation(),
                instance.host
            )));
        }
        Ok(answer)
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    #[instrument(skip_all, fields(host = %instance.host, operation = request.operation()))]
    async fn send(
        &self,
        instance: &RelayInstance,
        path: &str,
        request: &RelayRequest,
    ) -> Result<RelayResponse, OrchestratorError> {
        let start = Instant::now();
        let result = self.post(instance, path, request).await;
        metrics::record_relay_request(request.operation(), start.elapsed(), result.is_ok());

        match &result {
            Ok(_) => debug!(target: "ro.relay.http", host = %instance.host, operation = request.operation(), "Relay request completed"),
            Err(e) => warn!(target: "ro.relay.http", host = %instance.host, operation = request.operation(), error = %e, "Relay request failed"),
        }
        result
    }

    async fn poll_event(
        &self,
        instance: &RelayInstance,
        session: u64,
    ) -> Result<Option<String>, OrchestratorError> {
        let mut request = self
            .poll_client
            .get(Self::url(instance, &format!("/janus/{session}")));
        if let Some(secret) = self.secrets.get(&instance.host) {
            request = request.query(&[("apisecret", secret.expose_secret())]);
        }

        let body = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OrchestratorError::RelayUnavailable(format!("poll on {}: {e}", instance.host)))?
            .text()
            .await
            .map_err(|e| OrchestratorError::RelayUnavailable(format!("poll body: {e}")))?;

        if body.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(body))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::registry::CPU_UNKNOWN;
    use crate::relay::messages::MessageBody;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance(server: &MockServer) -> RelayInstance {
        RelayInstance {
            host: "relay-1".to_string(),
            control_url: server.uri(),
            event_url: "ws://relay-1:8188".to_string(),
            telemetry_url: "http://relay-1:7088/load".to_string(),
            cpu: CPU_UNKNOWN,
            connected: true,
            enabled: true,
        }
    }

    fn client(secret: Option<&str>) -> HttpRelayClient {
        let config = RelayInstanceConfig {
            host: "relay-1".to_string(),
            control_url: String::new(),
            event_url: String::new(),
            telemetry_url: String::new(),
            secret: secret.map(SecretString::from),
            enabled: true,
        };
        HttpRelayClient::new(&[config], Duration::from_secs(2), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_send_adds_api_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/janus"))
            .and(body_partial_json(json!({"janus": "create", "apisecret": "s3cret"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"janus": "success", "data": {"id": 555}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let answer = client(Some("s3cret"))
            .send(&instance(&server), "/janus", &RelayRequest::create_session())
            .await
            .unwrap();
        assert_eq!(answer.created_id().unwrap(), 555);
    }

    #[tokio::test]
    async fn test_send_without_secret_omits_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/janus/1/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "janus": "success",
                "plugindata": {"plugin": "janus.plugin.videoroom", "data": {"videoroom": "success", "exists": true}}
            })))
            .mount(&server)
            .await;

        let request = RelayRequest::message(MessageBody::Exists { room: 11_111_111 });
        let answer = client(None)
            .send(&instance(&server), "/janus/1/2", &request)
            .await
            .unwrap();
        assert!(answer.room_exists());

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert!(body.get("apisecret").is_none());
        assert_eq!(body["body"]["request"], "exists");
    }

    #[tokio::test]
    async fn test_send_error_answers_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/janus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"janus": "error", "error": {"code": 403, "reason": "Unauthorized request"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/janus/9"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/janus/9/9"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let relay = client(None);
        let instance = instance(&server);

        assert!(matches!(
            relay.send(&instance, "/janus", &RelayRequest::create_session()).await,
            Err(OrchestratorError::RelayUnavailable(msg)) if msg.contains("Unauthorized")
        ));
        assert!(matches!(
            relay.send(&instance, "/janus/9", &RelayRequest::attach()).await,
            Err(OrchestratorError::RelayUnavailable(_))
        ));
        assert!(matches!(
            relay.send(&instance, "/janus/9/9", &RelayRequest::trickle(None)).await,
            Err(OrchestratorError::RelayProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_event_uses_query_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/janus/321"))
            .and(query_param("apisecret", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"janus":"keepalive"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let event = client(Some("s3cret"))
            .poll_event(&instance(&server), 321)
            .await
            .unwrap();
        assert_eq!(event.as_deref(), Some(r#"{"janus":"keepalive"}"#));
    }

    #[tokio::test]
    async fn test_empty_poll_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/janus/4"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  \n"))
            .mount(&server)
            .await;

        let event = client(None).poll_event(&instance(&server), 4).await.unwrap();
        assert!(event.is_none());
    }
}
