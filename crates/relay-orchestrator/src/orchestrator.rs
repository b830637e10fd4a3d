//! Orchestrator facade.
//!
//! The operations the command-dispatch layer calls, each taking a stream,
//! the acting user and, where relevant, the client's publisher reference
//! (absent or `"0"` for the publisher role, `<sub>-<call>-<publisher>` for a
//! subscriber). Listener registrations return channels instead of taking
//! callbacks.

use crate::connection::ConnectionManager;
use crate::errors::OrchestratorError;
use crate::registry::{InstanceRegistry, RelayInstance};
use crate::relay::{Jsep, MediaFlags, MessageBody, RelayClient, RelayRequest, RoomParticipant};
use crate::role::Role;
use crate::session::{CandidateEvent, JoinOutcome, PendingCallbacks, SessionEventEngine, SessionKey};
use crate::store::SharedStore;
use crate::streams::StreamRepository;
use crate::users::{UserRepository, UserSession};
use common::types::{RoomKey, StreamId, UserId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};

/// A join waiting for the relay's SDP.
#[derive(Debug)]
pub struct PendingJoin {
    pub host: String,
    receiver: oneshot::Receiver<JoinOutcome>,
}

impl PendingJoin {
    /// Wait for the answer (publisher) or offer (subscriber) from the relay.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` if the completion was dropped, e.g. because the
    /// same device re-joined in the same role.
    pub async fn wait(self) -> Result<JoinOutcome, OrchestratorError> {
        self.receiver.await.map_err(|_| {
            OrchestratorError::RelayUnavailable("join completion abandoned".to_string())
        })
    }
}

pub struct RelayOrchestrator {
    connections: Arc<ConnectionManager>,
    engine: Arc<SessionEventEngine>,
    users: UserRepository,
    streams: StreamRepository,
}

impl RelayOrchestrator {
    /// Wire the connection manager and session engine with default backoffs.
    pub fn new(
        store: Arc<dyn SharedStore>,
        relay: Arc<dyn RelayClient>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&store),
            Arc::clone(&relay),
            Arc::clone(&registry),
        ));
        let engine = Arc::new(SessionEventEngine::new(
            relay,
            registry,
            Arc::clone(&connections),
            UserRepository::new(Arc::clone(&store)),
            StreamRepository::new(Arc::clone(&store)),
            Arc::new(PendingCallbacks::new()),
        ));
        Self::from_parts(store, connections, engine)
    }

    /// Assemble from preconfigured parts.
    pub fn from_parts(
        store: Arc<dyn SharedStore>,
        connections: Arc<ConnectionManager>,
        engine: Arc<SessionEventEngine>,
    ) -> Self {
        Self {
            connections,
            engine,
            users: UserRepository::new(Arc::clone(&store)),
            streams: StreamRepository::new(store),
        }
    }

    fn callbacks(&self) -> &Arc<PendingCallbacks> {
        self.engine.callbacks()
    }

    async fn room_for(&self, stream: StreamId) -> Result<RoomKey, OrchestratorError> {
        Ok(self.streams.load(stream).await?.room_key())
    }

    async fn user(&self, user: &UserId) -> Result<UserSession, OrchestratorError> {
        self.users.load(user).await
    }

    /// Attach `user` to the stream's room without joining it.
    pub async fn create_connection(
        &self,
        stream: StreamId,
        user: &UserId,
        publisher_ref: Option<&str>,
    ) -> Result<RelayInstance, OrchestratorError> {
        let room = self.room_for(stream).await?;
        let role = Role::from_publisher_ref(publisher_ref);
        self.connections.create_connection(&room, user, &role).await
    }

    /// Create the stream's relay room unless it exists. The user must already
    /// be attached in the given role.
    pub async fn create_room(
        &self,
        stream: StreamId,
        user: &UserId,
        publisher_ref: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let room = self.room_for(stream).await?;
        let role = Role::from_publisher_ref(publisher_ref);
        self.connections.ensure_room_exists(&room, user, &role).await
    }

    /// Join the stream's relay room.
    ///
    /// Buffers the offer and the completion, attaches, starts the session
    /// loop, ensures the room and sends `joinandconfigure` (publisher) or
    /// `join` on the target feed (subscriber). The returned [`PendingJoin`]
    /// resolves when the relay's SDP arrives on the event channel.
    ///
    /// # Errors
    ///
    /// `Validation("publisherId")` for an unusable publisher reference,
    /// checked before any side effect. `NotFound` for an unknown user or
    /// stream, `RelayUnavailable` when no instance accepts the attach.
    #[instrument(skip_all, fields(stream = %stream, user = %user))]
    pub async fn join_stream(
        &self,
        stream: StreamId,
        user: &UserId,
        publisher_ref: Option<&str>,
        offer: Option<String>,
        media: MediaFlags,
    ) -> Result<PendingJoin, OrchestratorError> {
        let role = Role::from_publisher_ref(publisher_ref);
        let feed = match &role {
            Role::Publisher => None,
            Role::Subscriber { .. } => Some(role.feed()?),
            Role::Service => return Err(OrchestratorError::Validation("publisherId".to_string())),
        };

        let session = self.user(user).await?;
        let room = self.room_for(stream).await?;
        let device = session.device.clone();
        let role_key = role.credential_key().to_string();

        if let Some(sdp) = offer.filter(|sdp| !sdp.trim().is_empty()) {
            self.callbacks()
                .buffer_offer(&device, &role_key, Jsep::offer(sdp))
                .await;
        }
        let receiver = self.callbacks().register_join(&device, &role_key).await;

        {
            let device = device.clone();
            let user = user.clone();
            let role_key = role_key.clone();
            self.streams
                .update(stream, move |s| s.add_participant(&device, &user, &role_key))
                .await?;
        }

        let instance = self.connections.create_connection(&room, user, &role).await?;
        self.engine.start(SessionKey {
            room: room.clone(),
            user: user.clone(),
            device,
            role: role.clone(),
        });

        self.connections.ensure_room_exists(&room, user, &role).await?;
        let room_id = self.connections.room_id_for(&room).await?;
        let body = match feed {
            Some(feed) => MessageBody::join_subscriber(room_id, feed),
            None => MessageBody::join_publisher(room_id, media),
        };
        self.connections
            .send_as(&room, user, &role, &RelayRequest::message(body))
            .await?;

        info!(target: "ro.connection", room = %room, host = %instance.host, role = %role, "Join sent");
        Ok(PendingJoin {
            host: instance.host,
            receiver,
        })
    }

    /// Hang up the user's publisher handle.
    pub async fn finish_stream(&self, stream: StreamId, user: &UserId) -> Result<(), OrchestratorError> {
        let room = self.room_for(stream).await?;
        self.connections.finish_stream(&room, user).await
    }

    /// Hand the client's SDP answer to the relay (`start`).
    pub async fn add_answer(
        &self,
        stream: StreamId,
        user: &UserId,
        publisher_ref: Option<&str>,
        sdp_answer: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let sdp = sdp_answer
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or_else(|| OrchestratorError::Validation("sdpAnswer".to_string()))?;
        let room = self.room_for(stream).await?;
        let role = Role::from_publisher_ref(publisher_ref);

        self.connections
            .send_as(
                &room,
                user,
                &role,
                &RelayRequest::message_with_jsep(MessageBody::Start, Jsep::answer(sdp)),
            )
            .await?;
        Ok(())
    }

    /// Trickle a client candidate. `None` signals end of candidates.
    pub async fn add_candidate(
        &self,
        stream: StreamId,
        user: &UserId,
        publisher_ref: Option<&str>,
        candidate: Option<Value>,
    ) -> Result<(), OrchestratorError> {
        let room = self.room_for(stream).await?;
        let role = Role::from_publisher_ref(publisher_ref);
        self.connections
            .send_as(&room, user, &role, &RelayRequest::trickle(candidate))
            .await?;
        Ok(())
    }

    /// Switch the publisher's audio/video on or off.
    pub async fn media_toggle(
        &self,
        stream: StreamId,
        user: &UserId,
        media: MediaFlags,
    ) -> Result<(), OrchestratorError> {
        let room = self.room_for(stream).await?;
        self.connections
            .send_as(
                &room,
                user,
                &Role::Publisher,
                &RelayRequest::message(MessageBody::configure_media(media)),
            )
            .await?;
        debug!(target: "ro.connection", room = %room, audio = media.audio, video = media.video, "Media toggled");
        Ok(())
    }

    /// Relay ICE candidates for the user's device in the given role.
    pub async fn on_candidate(
        &self,
        user: &UserId,
        publisher_ref: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<CandidateEvent>, OrchestratorError> {
        let session = self.user(user).await?;
        let role = Role::from_publisher_ref(publisher_ref);
        Ok(self
            .callbacks()
            .register_candidates(&session.device, role.credential_key())
            .await)
    }

    /// Participant list updates for the user's device.
    pub async fn on_change_publishers(
        &self,
        user: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<Vec<RoomParticipant>>, OrchestratorError> {
        let session = self.user(user).await?;
        Ok(self.callbacks().register_publishers(&session.device).await)
    }

    /// Resolves once media starts flowing for the user's device.
    pub async fn on_connected(
        &self,
        user: &UserId,
    ) -> Result<oneshot::Receiver<()>, OrchestratorError> {
        let session = self.user(user).await?;
        Ok(self.callbacks().register_connected(&session.device).await)
    }

    /// Live participants of the stream's room, queried through the user's
    /// service attachment (created on first use).
    pub async fn get_publishers_ext(
        &self,
        stream: StreamId,
        user: &UserId,
    ) -> Result<Vec<RoomParticipant>, OrchestratorError> {
        let room = self.room_for(stream).await?;
        let role = Role::Service;

        let attached = self
            .user(user)
            .await?
            .credential(&room, &role)
            .is_some_and(|c| c.is_attached());
        if !attached {
            self.connections.create_connection(&room, user, &role).await?;
        }
        self.connections.list_participants(&room, user, &role).await
    }

    /// Transport connection closed: drop the device's pending callbacks and
    /// the user session.
    pub async fn disconnect_user(&self, user: &UserId) -> Result<(), OrchestratorError> {
        match self.user(user).await {
            Ok(session) => self.callbacks().forget_device(&session.device).await,
            Err(OrchestratorError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.users.delete(user).await
    }
}
