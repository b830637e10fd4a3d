//! Client push events.
//!
//! The coordinator publishes [`Envelope`]s on a broadcast channel; the
//! transport layer subscribes and frames them for the addressed socket.

use crate::streams::model::Party;
use common::types::StreamId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the push channel. Slow subscribers lag and lose old events.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

/// One entry of a `stream/list` push.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    pub started: chrono::DateTime<chrono::Utc>,
    pub presenter: Option<Party>,
    pub viewer: Option<Party>,
    pub sdp_offer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// To the presenter: a viewer joined with this answer.
    #[serde(rename_all = "camelCase")]
    StreamJoined {
        stream: StreamId,
        sdp_answer: String,
        viewer: Party,
    },
    /// To the presenter: the viewer left.
    StreamLeft { stream: StreamId },
    /// To the viewer: the presenter ended the stream.
    StreamDestroyed { stream: StreamId },
    /// ICE candidate forwarded to the other party.
    PeerIce { stream: StreamId, candidate: Value },
    StreamList { streams: Vec<StreamSummary> },
    /// Opaque control payload forwarded to the presenter.
    #[serde(rename_all = "camelCase")]
    ScreenControl { stream: StreamId, screen_data: Value },
}

impl ClientEvent {
    /// Client command path of the push.
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            ClientEvent::StreamJoined { .. } => "/v1/stream/joined",
            ClientEvent::StreamLeft { .. } => "/v1/stream/leaved",
            ClientEvent::StreamDestroyed { .. } => "/v1/stream/destroyed",
            ClientEvent::PeerIce { .. } => "/v1/sdp/peer_ice",
            ClientEvent::StreamList { .. } => "/v1/stream/list",
            ClientEvent::ScreenControl { .. } => "/v1/user/screen/control",
        }
    }
}

/// A push addressed to one transport socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub socket: String,
    pub event: ClientEvent,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Envelope>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Push `event` to `socket`. Without subscribers the event is dropped.
    pub fn send(&self, socket: &str, event: ClientEvent) {
        let command = event.command();
        if self
            .tx
            .send(Envelope {
                socket: socket.to_string(),
                event,
            })
            .is_err()
        {
            debug!(target: "ro.notify", command, "No transport subscribed, push dropped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_addressed_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.send("sock-a", ClientEvent::StreamLeft { stream: StreamId(3) });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.socket, "sock-a");
        assert_eq!(envelope.event.command(), "/v1/stream/leaved");
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        Notifier::new().send("sock-a", ClientEvent::StreamDestroyed { stream: StreamId(1) });
    }

    #[test]
    fn test_event_payload_shape() {
        let event = ClientEvent::ScreenControl {
            stream: StreamId(9),
            screen_data: serde_json::json!({"x": 1}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "screenControl");
        assert_eq!(json["stream"], 9);
        assert_eq!(json["screenData"]["x"], 1);
    }
}
