//! Pending callbacks of the session event engine.
//!
//! One-shot completions (join, connected) are `oneshot` senders removed from
//! their map when fired, so each fires at most once. Durable listeners
//! (candidates, participant changes) are unbounded `mpsc` senders kept until
//! teardown or until the receiver goes away.

use crate::relay::{Jsep, RoomParticipant};
use common::types::{DeviceId, RoomKey};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

/// (device, role credential key)
type DeviceRole = (DeviceId, String);

fn device_role(device: &DeviceId, role_key: &str) -> DeviceRole {
    (device.clone(), role_key.to_string())
}

/// Result of a join: the relay's SDP and, for publishers, the relay-assigned
/// publisher id (0 when not known).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub sdp: String,
    pub publisher_id: u64,
}

/// Relay ICE candidates for one (device, role).
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateEvent {
    Candidate(Value),
    /// The handle left the room; no more candidates follow.
    Terminal(Option<Value>),
}

#[derive(Default)]
pub struct PendingCallbacks {
    joins: Mutex<HashMap<DeviceRole, oneshot::Sender<JoinOutcome>>>,
    connected: Mutex<HashMap<DeviceId, oneshot::Sender<()>>>,
    candidates: Mutex<HashMap<DeviceRole, mpsc::UnboundedSender<CandidateEvent>>>,
    publishers: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<Vec<RoomParticipant>>>>,
    offers: Mutex<HashMap<DeviceRole, Jsep>>,
    publisher_ids: Mutex<HashMap<(RoomKey, DeviceId), u64>>,
}

impl PendingCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the join completion for (device, role). Replaces any earlier
    /// registration; the earlier receiver then sees a closed channel.
    pub async fn register_join(
        &self,
        device: &DeviceId,
        role_key: &str,
    ) -> oneshot::Receiver<JoinOutcome> {
        let (tx, rx) = oneshot::channel();
        self.joins.lock().await.insert(device_role(device, role_key), tx);
        rx
    }

    /// Fire and remove the join completion. Returns whether one was pending.
    pub async fn complete_join(&self, device: &DeviceId, role_key: &str, outcome: JoinOutcome) -> bool {
        let pending = self
            .joins
            .lock()
            .await
            .remove(&device_role(device, role_key));
        match pending {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub async fn register_connected(&self, device: &DeviceId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.connected.lock().await.insert(device.clone(), tx);
        rx
    }

    pub async fn fire_connected(&self, device: &DeviceId) -> bool {
        match self.connected.lock().await.remove(device) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub async fn register_candidates(
        &self,
        device: &DeviceId,
        role_key: &str,
    ) -> mpsc::UnboundedReceiver<CandidateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.candidates
            .lock()
            .await
            .insert(device_role(device, role_key), tx);
        rx
    }

    /// Forward a relay candidate. Drops the listener if its receiver is gone.
    pub async fn send_candidate(&self, device: &DeviceId, role_key: &str, candidate: Value) -> bool {
        let key = device_role(device, role_key);
        let mut candidates = self.candidates.lock().await;
        let Some(tx) = candidates.get(&key) else {
            return false;
        };
        if tx.send(CandidateEvent::Candidate(candidate)).is_ok() {
            true
        } else {
            candidates.remove(&key);
            false
        }
    }

    /// Trickle finished: drop the listener without a terminal event.
    pub async fn finish_candidates(&self, device: &DeviceId, role_key: &str) {
        self.candidates
            .lock()
            .await
            .remove(&device_role(device, role_key));
    }

    /// Handle left: send the terminal event and drop the listener.
    pub async fn terminate_candidates(&self, device: &DeviceId, role_key: &str, payload: Option<Value>) {
        let removed = self
            .candidates
            .lock()
            .await
            .remove(&device_role(device, role_key));
        if let Some(tx) = removed {
            let _ = tx.send(CandidateEvent::Terminal(payload));
        }
    }

    pub async fn register_publishers(
        &self,
        device: &DeviceId,
    ) -> mpsc::UnboundedReceiver<Vec<RoomParticipant>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.publishers.lock().await.insert(device.clone(), tx);
        rx
    }

    pub async fn has_publishers_listener(&self, device: &DeviceId) -> bool {
        self.publishers.lock().await.contains_key(device)
    }

    pub async fn notify_publishers(&self, device: &DeviceId, participants: Vec<RoomParticipant>) {
        let mut publishers = self.publishers.lock().await;
        let closed = publishers
            .get(device)
            .is_some_and(|tx| tx.send(participants).is_err());
        if closed {
            publishers.remove(device);
        }
    }

    /// Drop every listener and pending completion for `device`.
    pub async fn forget_device(&self, device: &DeviceId) {
        self.joins.lock().await.retain(|(d, _), _| d != device);
        self.connected.lock().await.remove(device);
        self.candidates.lock().await.retain(|(d, _), _| d != device);
        self.publishers.lock().await.remove(device);
        self.offers.lock().await.retain(|(d, _), _| d != device);
        self.publisher_ids.lock().await.retain(|(_, d), _| d != device);
    }

    /// Hold the client's offer until the relay acknowledges the join.
    pub async fn buffer_offer(&self, device: &DeviceId, role_key: &str, offer: Jsep) {
        self.offers
            .lock()
            .await
            .insert(device_role(device, role_key), offer);
    }

    pub async fn take_offer(&self, device: &DeviceId, role_key: &str) -> Option<Jsep> {
        self.offers
            .lock()
            .await
            .remove(&device_role(device, role_key))
    }

    pub async fn record_publisher_id(&self, room: &RoomKey, device: &DeviceId, publisher_id: u64) {
        self.publisher_ids
            .lock()
            .await
            .insert((room.clone(), device.clone()), publisher_id);
    }

    /// Relay-assigned publisher id, 0 when not yet known.
    pub async fn publisher_id(&self, room: &RoomKey, device: &DeviceId) -> u64 {
        self.publisher_ids
            .lock()
            .await
            .get(&(room.clone(), device.clone()))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::StreamId;
    use serde_json::json;

    fn device() -> DeviceId {
        DeviceId("d1".to_string())
    }

    #[tokio::test]
    async fn test_join_fires_once() {
        let callbacks = PendingCallbacks::new();
        let rx = callbacks.register_join(&device(), "0").await;
        let outcome = JoinOutcome {
            sdp: "answer".to_string(),
            publisher_id: 7,
        };

        assert!(callbacks.complete_join(&device(), "0", outcome.clone()).await);
        assert!(!callbacks.complete_join(&device(), "0", outcome.clone()).await);
        assert_eq!(rx.await.unwrap(), outcome);
    }

    #[tokio::test]
    async fn test_join_is_keyed_by_role() {
        let callbacks = PendingCallbacks::new();
        let publisher = callbacks.register_join(&device(), "0").await;
        let _subscriber = callbacks.register_join(&device(), "1-1-5").await;

        let outcome = JoinOutcome {
            sdp: "sub".to_string(),
            publisher_id: 0,
        };
        assert!(callbacks.complete_join(&device(), "1-1-5", outcome).await);
        drop(callbacks);
        assert!(publisher.await.is_err(), "publisher join never fired");
    }

    #[tokio::test]
    async fn test_connected_fires_once() {
        let callbacks = PendingCallbacks::new();
        let rx = callbacks.register_connected(&device()).await;

        assert!(callbacks.fire_connected(&device()).await);
        assert!(!callbacks.fire_connected(&device()).await);
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_candidates_are_durable_until_terminated() {
        let callbacks = PendingCallbacks::new();
        let mut rx = callbacks.register_candidates(&device(), "0").await;

        assert!(callbacks.send_candidate(&device(), "0", json!({"candidate": "a"})).await);
        assert!(callbacks.send_candidate(&device(), "0", json!({"candidate": "b"})).await);
        callbacks.terminate_candidates(&device(), "0", None).await;
        assert!(!callbacks.send_candidate(&device(), "0", json!({"candidate": "c"})).await);

        assert_eq!(rx.recv().await.unwrap(), CandidateEvent::Candidate(json!({"candidate": "a"})));
        assert_eq!(rx.recv().await.unwrap(), CandidateEvent::Candidate(json!({"candidate": "b"})));
        assert_eq!(rx.recv().await.unwrap(), CandidateEvent::Terminal(None));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_candidate_receiver_is_pruned() {
        let callbacks = PendingCallbacks::new();
        drop(callbacks.register_candidates(&device(), "0").await);

        assert!(!callbacks.send_candidate(&device(), "0", json!({"candidate": "a"})).await);
        assert!(callbacks.candidates.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_offers_and_publisher_ids() {
        let callbacks = PendingCallbacks::new();
        let room = RoomKey::for_stream(StreamId(4));

        callbacks.buffer_offer(&device(), "0", Jsep::offer("v=0")).await;
        assert_eq!(callbacks.take_offer(&device(), "0").await, Some(Jsep::offer("v=0")));
        assert!(callbacks.take_offer(&device(), "0").await.is_none());

        assert_eq!(callbacks.publisher_id(&room, &device()).await, 0);
        callbacks.record_publisher_id(&room, &device(), 31337).await;
        assert_eq!(callbacks.publisher_id(&room, &device()).await, 31337);

        callbacks.forget_device(&device()).await;
        assert_eq!(callbacks.publisher_id(&room, &device()).await, 0);
    }
}
