//! Session event loop.
//!
//! One task per (room, device, role). Each iteration long-polls the relay
//! session's event channel and dispatches the event to completion before the
//! next poll. Transport and parse failures, and errors the relay reports on
//! the channel, are logged and the loop re-polls after a short backoff. The
//! loop stops on the handle's `left` event, or when the user session, its
//! relay credential or the relay session itself no longer exists.

use super::callbacks::{JoinOutcome, PendingCallbacks};
use crate::connection::ConnectionManager;
use crate::errors::OrchestratorError;
use crate::observability::metrics;
use crate::registry::{InstanceRegistry, RelayInstance};
use crate::relay::{MessageBody, RelayClient, RelayEvent, RelayRequest, NO_SUCH_SESSION};
use crate::role::Role;
use crate::streams::StreamRepository;
use crate::users::UserRepository;
use common::types::{DeviceId, RoomKey, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Pause before re-polling after a failed iteration.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Identity of one session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub room: RoomKey,
    pub user: UserId,
    pub device: DeviceId,
    pub role: Role,
}

impl SessionKey {
    fn role_key(&self) -> &str {
        self.role.credential_key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

pub struct SessionEventEngine {
    relay: Arc<dyn RelayClient>,
    registry: Arc<InstanceRegistry>,
    connections: Arc<ConnectionManager>,
    users: UserRepository,
    streams: StreamRepository,
    callbacks: Arc<PendingCallbacks>,
    error_backoff: Duration,
}

impl SessionEventEngine {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        registry: Arc<InstanceRegistry>,
        connections: Arc<ConnectionManager>,
        users: UserRepository,
        streams: StreamRepository,
        callbacks: Arc<PendingCallbacks>,
    ) -> Self {
        Self {
            relay,
            registry,
            connections,
            users,
            streams,
            callbacks,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    #[must_use]
    pub fn callbacks(&self) -> &Arc<PendingCallbacks> {
        &self.callbacks
    }

    /// Spawn the event loop for `key`.
    pub fn start(self: &Arc<Self>, key: SessionKey) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let span = tracing::info_span!(
            "ro.session",
            room = %key.room,
            user = %key.user,
            role = %key.role
        );
        tokio::spawn(engine.run(key).instrument(span))
    }

    async fn run(self: Arc<Self>, key: SessionKey) {
        metrics::session_loop_started();
        debug!(target: "ro.session", room = %key.room, user = %key.user, role = %key.role, "Session loop started");

        loop {
            match self.poll_once(&key).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(OrchestratorError::NotFound(what)) => {
                    warn!(target: "ro.session", room = %key.room, user = %key.user, missing = %what, "Session gone, stopping loop");
                    break;
                }
                Err(e) => {
                    warn!(target: "ro.session", room = %key.room, user = %key.user, error = %e, "Session loop iteration failed");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        metrics::session_loop_stopped();
        debug!(target: "ro.session", room = %key.room, user = %key.user, role = %key.role, "Session loop stopped");
    }

    async fn poll_once(&self, key: &SessionKey) -> Result<Step, OrchestratorError> {
        let user = self.users.load(&key.user).await?;
        let session = user
            .credential(&key.room, &key.role)
            .and_then(|c| c.session)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("relay credential for {} in room {}", key.user, key.room))
            })?;

        let instance = self.registry.select_instance_for_room(&key.room).await?;
        let Some(raw) = self.relay.poll_event(&instance, session).await? else {
            return Ok(Step::Continue);
        };

        let event = RelayEvent::parse(&raw)?;
        metrics::record_session_event(event.kind());
        self.dispatch(key, &instance, event).await
    }

    async fn dispatch(
        &self,
        key: &SessionKey,
        instance: &RelayInstance,
        event: RelayEvent,
    ) -> Result<Step, OrchestratorError> {
        match event {
            RelayEvent::KeepAlive | RelayEvent::Other(_) => {}
            RelayEvent::Error {
                code: Some(NO_SUCH_SESSION),
                reason,
            } => {
                return Err(OrchestratorError::NotFound(format!("relay session: {reason}")));
            }
            RelayEvent::Error { code, reason } => {
                return Err(OrchestratorError::RelayUnavailable(format!(
                    "event channel error {}: {reason}",
                    code.map_or_else(|| "?".to_string(), |c| c.to_string())
                )));
            }
            RelayEvent::Media {
                receiving: Some(false),
            } => {
                info!(target: "ro.session", room = %key.room, user = %key.user, "Media stopped, hanging up");
                self.connections.finish_stream(&key.room, &key.user).await?;
                self.refresh_publishers(key).await;
            }
            RelayEvent::Media {
                receiving: Some(true),
            } => {
                self.callbacks.fire_connected(&key.device).await;
                self.refresh_publishers(key).await;
            }
            RelayEvent::Media { receiving: None }
            | RelayEvent::WebRtcUp
            | RelayEvent::Configured
            | RelayEvent::Hangup => {
                self.refresh_publishers(key).await;
            }
            RelayEvent::Answer { sdp } => {
                let publisher_id = if key.role.is_publisher() {
                    self.callbacks.publisher_id(&key.room, &key.device).await
                } else {
                    0
                };
                self.callbacks
                    .complete_join(&key.device, key.role_key(), JoinOutcome { sdp, publisher_id })
                    .await;
            }
            RelayEvent::Candidate(candidate) => {
                self.callbacks
                    .send_candidate(&key.device, key.role_key(), candidate)
                    .await;
            }
            RelayEvent::CandidatesComplete => {
                self.callbacks
                    .finish_candidates(&key.device, key.role_key())
                    .await;
            }
            RelayEvent::Joined { publisher_id } => {
                self.callbacks
                    .record_publisher_id(&key.room, &key.device, publisher_id)
                    .await;
                match self.callbacks.take_offer(&key.device, key.role_key()).await {
                    Some(offer) => {
                        let path = self.connections.request_path(&key.user, &key.room, &key.role).await?;
                        self.relay
                            .send(
                                instance,
                                &path,
                                &RelayRequest::message_with_jsep(MessageBody::configure(), offer),
                            )
                            .await?;
                    }
                    None => {
                        debug!(target: "ro.session", room = %key.room, user = %key.user, "Joined without a buffered offer");
                    }
                }
                self.refresh_publishers(key).await;
            }
            RelayEvent::Attached { sdp } => {
                if let Some(sdp) = sdp {
                    self.callbacks
                        .complete_join(&key.device, key.role_key(), JoinOutcome { sdp, publisher_id: 0 })
                        .await;
                }
                self.refresh_publishers(key).await;
            }
            RelayEvent::Left => {
                self.handle_left(key).await;
                return Ok(Step::Stop);
            }
        }
        Ok(Step::Continue)
    }

    /// Push the current participant list to the device's listener, if any.
    async fn refresh_publishers(&self, key: &SessionKey) {
        if !self.callbacks.has_publishers_listener(&key.device).await {
            return;
        }
        match self
            .connections
            .list_participants(&key.room, &key.user, &key.role)
            .await
        {
            Ok(participants) => {
                self.callbacks
                    .notify_publishers(&key.device, participants)
                    .await;
            }
            Err(e) => {
                warn!(target: "ro.session", room = %key.room, error = %e, "Failed to refresh participant list");
            }
        }
    }

    /// Terminal transition. Destroys the room when nobody is left, then
    /// drops this handle's credential, stream membership and candidate
    /// listener.
    async fn handle_left(&self, key: &SessionKey) {
        let remaining = self
            .connections
            .list_participants(&key.room, &key.user, &key.role)
            .await;

        match remaining {
            Ok(participants) if participants.is_empty() => {
                // Destroy first: addressing the room reselects and re-pins it.
                if let Err(e) = self
                    .connections
                    .destroy_room(&key.room, &key.user, &key.role)
                    .await
                {
                    warn!(target: "ro.session", room = %key.room, error = %e, "Failed to destroy empty relay room");
                }
                self.registry.invalidate_room(&key.room).await;
                if let Some(id) = key.room.stream_id() {
                    if let Err(e) = self.streams.clear_pin(id).await {
                        warn!(target: "ro.session", room = %key.room, error = %e, "Failed to clear instance pin");
                    }
                }
            }
            Ok(participants) => {
                debug!(target: "ro.session", room = %key.room, remaining = participants.len(), "Participant left, room still in use");
            }
            Err(e) => {
                warn!(target: "ro.session", room = %key.room, error = %e, "Cannot count remaining participants, keeping room");
            }
        }

        let room = key.room.clone();
        let role = key.role.clone();
        match self
            .users
            .update(&key.user, move |user| user.clear_credential(&room, &role))
            .await
        {
            Ok(_) | Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => {
                warn!(target: "ro.session", room = %key.room, user = %key.user, error = %e, "Failed to clear relay credential");
            }
        }

        if let Some(id) = key.room.stream_id() {
            let device = key.device.clone();
            let role_key = key.role_key().to_string();
            match self
                .streams
                .update(id, move |stream| stream.remove_participant(&device, &role_key))
                .await
            {
                Ok(_) | Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => {
                    warn!(target: "ro.session", room = %key.room, error = %e, "Failed to drop stream participant");
                }
            }
        }

        self.callbacks
            .terminate_candidates(&key.device, key.role_key(), None)
            .await;
        info!(target: "ro.session", room = %key.room, user = %key.user, role = %key.role, "Participant left relay room");
    }
}
