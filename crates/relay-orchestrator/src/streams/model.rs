//! Stream records.

use crate::errors::OrchestratorError;
use crate::users::UserSession;
use chrono::{DateTime, Utc};
use common::types::{random_hex_id, DeviceId, RoomKey, StreamId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One side of a call: presenter or viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: UserId,
    pub ip: String,
    pub socket: String,
    /// Client application tag supplied by the presenter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl Party {
    #[must_use]
    pub fn from_user(user: &UserSession, client: Option<String>) -> Self {
        Self {
            id: user.id.clone(),
            ip: user.ip.clone(),
            socket: user.socket.clone(),
            client,
        }
    }
}

/// A watch-only publisher or subscriber attached in the multi-party flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user: UserId,
    /// Role credential keys this device holds in the room.
    pub roles: Vec<String>,
}

/// A logical call: one presenter, at most one viewer, plus any number of
/// multi-party participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: StreamId,
    pub hash: String,
    pub started: DateTime<Utc>,
    pub sdp_offer: String,
    pub presenter: Option<Party>,
    pub viewer: Option<Party>,
    /// device id -> participant
    #[serde(default)]
    pub participants: BTreeMap<DeviceId, Participant>,
    /// Sticky relay instance pin (host).
    #[serde(default)]
    pub media_instance: Option<String>,
}

impl Stream {
    /// New stream presented by `presenter`.
    ///
    /// # Errors
    ///
    /// `Internal` if the opaque hash cannot be generated.
    pub fn new(
        id: StreamId,
        presenter: Party,
        sdp_offer: String,
    ) -> Result<Self, OrchestratorError> {
        let hash = random_hex_id()
            .map_err(|e| OrchestratorError::Internal(format!("stream hash: {e}")))?;

        Ok(Self {
            id,
            hash,
            started: Utc::now(),
            sdp_offer,
            presenter: Some(presenter),
            viewer: None,
            participants: BTreeMap::new(),
            media_instance: None,
        })
    }

    #[must_use]
    pub fn room_key(&self) -> RoomKey {
        RoomKey::for_stream(self.id)
    }

    /// Presenter, viewer and multi-party participants currently attached.
    #[must_use]
    pub fn active_participants(&self) -> usize {
        usize::from(self.presenter.is_some())
            + usize::from(self.viewer.is_some())
            + self.participants.len()
    }

    #[must_use]
    pub fn is_presenter(&self, user: &UserId) -> bool {
        self.presenter.as_ref().is_some_and(|p| &p.id == user)
    }

    #[must_use]
    pub fn is_viewer(&self, user: &UserId) -> bool {
        self.viewer.as_ref().is_some_and(|v| &v.id == user)
    }

    /// Record that `device` holds `role_key` in this stream's room.
    pub fn add_participant(&mut self, device: &DeviceId, user: &UserId, role_key: &str) {
        let entry = self
            .participants
            .entry(device.clone())
            .or_insert_with(|| Participant {
                user: user.clone(),
                roles: Vec::new(),
            });
        if !entry.roles.iter().any(|r| r == role_key) {
            entry.roles.push(role_key.to_string());
        }
    }

    /// Drop `role_key` for `device`; the participant goes once it holds no roles.
    pub fn remove_participant(&mut self, device: &DeviceId, role_key: &str) {
        if let Some(entry) = self.participants.get_mut(device) {
            entry.roles.retain(|r| r != role_key);
            if entry.roles.is_empty() {
                self.participants.remove(device);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn presenter() -> Party {
        Party {
            id: UserId::from("alice"),
            ip: "10.0.0.1".to_string(),
            socket: "alice".to_string(),
            client: Some("desktop".to_string()),
        }
    }

    #[test]
    fn test_new_stream() {
        let stream = Stream::new(StreamId(1), presenter(), "o1".to_string()).unwrap();

        assert_eq!(stream.hash.len(), 32);
        assert_eq!(stream.sdp_offer, "o1");
        assert!(stream.viewer.is_none());
        assert!(stream.media_instance.is_none());
        assert_eq!(stream.active_participants(), 1);
        assert_eq!(stream.room_key().as_str(), "1");
    }

    #[test]
    fn test_record_uses_camel_case_fields() {
        let mut stream = Stream::new(StreamId(3), presenter(), "o1".to_string()).unwrap();
        stream.media_instance = Some("relay-1".to_string());

        let json = serde_json::to_value(&stream).unwrap();
        assert_eq!(json["sdpOffer"], "o1");
        assert_eq!(json["mediaInstance"], "relay-1");
        assert_eq!(json["presenter"]["client"], "desktop");

        let back: Stream = serde_json::from_value(json).unwrap();
        assert_eq!(back, stream);
    }

    #[test]
    fn test_participants_count_towards_activity() {
        let mut stream = Stream::new(StreamId(3), presenter(), "o1".to_string()).unwrap();
        let device = DeviceId("dev-1".to_string());
        let bob = UserId::from("bob");

        stream.add_participant(&device, &bob, "0");
        stream.add_participant(&device, &bob, "2-1-77");
        stream.add_participant(&device, &bob, "0");
        assert_eq!(stream.active_participants(), 2);
        assert_eq!(stream.participants[&device].roles.len(), 2);

        stream.remove_participant(&device, "0");
        assert_eq!(stream.active_participants(), 2);
        stream.remove_participant(&device, "2-1-77");
        assert_eq!(stream.active_participants(), 1);
    }

    #[test]
    fn test_presenter_and_viewer_checks() {
        let mut stream = Stream::new(StreamId(3), presenter(), "o1".to_string()).unwrap();
        stream.viewer = Some(Party {
            id: UserId::from("bob"),
            ip: "10.0.0.2".to_string(),
            socket: "bob".to_string(),
            client: None,
        });

        assert!(stream.is_presenter(&UserId::from("alice")));
        assert!(stream.is_viewer(&UserId::from("bob")));
        assert!(!stream.is_viewer(&UserId::from("carol")));
    }
}
