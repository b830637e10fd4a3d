//! Stream Lifecycle Coordinator.
//!
//! `Created -> Live -> Viewed <-> Live -> Destroyed` for 1:1 streams, plus
//! ICE relay between the two parties, screen-control forwarding and the
//! stream-list subscription. Inputs arrive as options so a missing field is
//! rejected with `Validation` before anything is touched.

use super::model::{Party, Stream};
use super::reaper::{run_reaper_cycle, ReapSummary};
use super::repository::StreamRepository;
use crate::errors::OrchestratorError;
use crate::notify::{ClientEvent, Notifier, StreamSummary};
use crate::registry::InstanceRegistry;
use crate::store::{keys, SharedStore};
use crate::users::UserRepository;
use common::types::{StreamId, UserId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Message of the 409 returned when the viewer slot is taken.
pub const VIEWER_SLOT_TAKEN: &str = "Somebody else is watching this stream now";

fn required<T>(value: Option<T>, field: &str) -> Result<T, OrchestratorError> {
    value.ok_or_else(|| OrchestratorError::Validation(field.to_string()))
}

fn required_text(value: Option<String>, field: &str) -> Result<String, OrchestratorError> {
    required(value.filter(|v| !v.trim().is_empty()), field)
}

pub struct StreamCoordinator {
    store: Arc<dyn SharedStore>,
    streams: StreamRepository,
    users: UserRepository,
    notifier: Notifier,
    registry: Arc<InstanceRegistry>,
}

impl StreamCoordinator {
    /// `registry` owns the placement cache that deleted streams are
    /// evicted from.
    pub fn new(
        store: Arc<dyn SharedStore>,
        notifier: Notifier,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            streams: StreamRepository::new(Arc::clone(&store)),
            users: UserRepository::new(Arc::clone(&store)),
            store,
            notifier,
            registry,
        }
    }

    #[must_use]
    pub fn streams(&self) -> &StreamRepository {
        &self.streams
    }

    /// Start a stream presented by `user`.
    ///
    /// # Errors
    ///
    /// `Validation("sdpOffer")` without an offer, `NotFound` for an unknown
    /// user, `Store` when the record cannot be written.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn start(
        &self,
        user: &UserId,
        sdp_offer: Option<String>,
        client: Option<String>,
    ) -> Result<Stream, OrchestratorError> {
        let sdp_offer = required_text(sdp_offer, "sdpOffer")?;
        let presenter = self.users.load(user).await?;

        let id = self.streams.allocate_id().await?;
        let stream = Stream::new(id, Party::from_user(&presenter, client), sdp_offer)?;
        self.streams.save(&stream).await?;

        info!(target: "ro.streams", stream = %id, presenter = %user, "Stream started");
        Ok(stream)
    }

    /// One reaper pass over `streamList`.
    pub async fn reap(&self) -> Result<ReapSummary, OrchestratorError> {
        run_reaper_cycle(&self.streams, &self.users, &self.notifier, &self.registry).await
    }

    pub async fn load(&self, id: StreamId) -> Result<Stream, OrchestratorError> {
        self.streams.load(id).await
    }

    /// Attach `user` as the viewer and hand the answer to the presenter.
    ///
    /// # Errors
    ///
    /// `Conflict` if a viewer is already attached.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn view(
        &self,
        stream: Option<StreamId>,
        user: &UserId,
        sdp_answer: Option<String>,
    ) -> Result<Stream, OrchestratorError> {
        let id = required(stream, "stream")?;
        let sdp_answer = required_text(sdp_answer, "sdpAnswer")?;

        let viewer = self.users.load(user).await?;
        let mut stream = self.streams.load(id).await?;
        if stream.viewer.is_some() {
            debug!(target: "ro.streams", stream = %id, user = %user, "Viewer slot taken");
            return Err(OrchestratorError::Conflict(VIEWER_SLOT_TAKEN.to_string()));
        }

        let party = Party::from_user(&viewer, None);
        stream.viewer = Some(party.clone());
        self.streams.save(&stream).await?;

        if let Some(presenter) = &stream.presenter {
            self.notifier.send(
                &presenter.socket,
                ClientEvent::StreamJoined {
                    stream: id,
                    sdp_answer,
                    viewer: party,
                },
            );
        }
        info!(target: "ro.streams", stream = %id, viewer = %user, "Viewer joined");
        Ok(stream)
    }

    /// Detach the viewer. The stream stays live for the presenter.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn leave(
        &self,
        stream: Option<StreamId>,
        user: &UserId,
    ) -> Result<Stream, OrchestratorError> {
        let id = required(stream, "stream")?;
        let stream = self.streams.update(id, |s| s.viewer = None).await?;

        if let Some(presenter) = &stream.presenter {
            self.notifier
                .send(&presenter.socket, ClientEvent::StreamLeft { stream: id });
        }
        info!(target: "ro.streams", stream = %id, user = %user, "Viewer left");
        Ok(stream)
    }

    /// Remove the stream, telling the viewer first.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn destroy(
        &self,
        stream: Option<StreamId>,
        user: &UserId,
    ) -> Result<(), OrchestratorError> {
        let id = required(stream, "stream")?;
        let stream = self.streams.load(id).await?;

        if let Some(viewer) = &stream.viewer {
            self.notifier
                .send(&viewer.socket, ClientEvent::StreamDestroyed { stream: id });
        }
        self.streams.delete(id).await?;
        self.registry.invalidate_room(&stream.room_key()).await;
        info!(target: "ro.streams", stream = %id, user = %user, "Stream destroyed");

        if let Err(e) = self.broadcast_stream_list().await {
            warn!(target: "ro.streams", error = %e, "Stream list broadcast after destroy failed");
        }
        Ok(())
    }

    /// Relay an ICE candidate from one party to the other.
    ///
    /// # Errors
    ///
    /// `NotFound` when `user` is neither presenter nor viewer.
    pub async fn forward_ice(
        &self,
        stream: Option<StreamId>,
        user: &UserId,
        candidate: Value,
    ) -> Result<(), OrchestratorError> {
        let id = required(stream, "stream")?;
        let stream = self.streams.load(id).await?;

        let peer = if stream.is_presenter(user) {
            stream.viewer.as_ref()
        } else if stream.is_viewer(user) {
            stream.presenter.as_ref()
        } else {
            return Err(OrchestratorError::NotFound(format!("user {user} in stream {id}")));
        };

        match peer {
            Some(peer) => self.notifier.send(
                &peer.socket,
                ClientEvent::PeerIce {
                    stream: id,
                    candidate,
                },
            ),
            None => debug!(target: "ro.streams", stream = %id, "ICE candidate without a peer dropped"),
        }
        Ok(())
    }

    /// Forward an opaque control payload to the presenter.
    pub async fn screen_control(
        &self,
        stream: Option<StreamId>,
        screen_data: Option<Value>,
    ) -> Result<(), OrchestratorError> {
        let screen_data = required(screen_data.filter(|d| !d.is_null()), "screenData")?;
        let id = required(stream, "stream")?;
        let stream = self.streams.load(id).await?;

        if let Some(presenter) = &stream.presenter {
            self.notifier.send(
                &presenter.socket,
                ClientEvent::ScreenControl {
                    stream: id,
                    screen_data,
                },
            );
        }
        Ok(())
    }

    /// Subscribe the user's socket to stream-list pushes.
    pub async fn observe(&self, user: &UserId) -> Result<(), OrchestratorError> {
        let user = self.users.load(user).await?;
        self.store
            .hset(keys::STREAM_OBSERVERS, user.id.as_str(), &user.socket)
            .await
    }

    pub async fn abandon(&self, user: &UserId) -> Result<(), OrchestratorError> {
        self.store
            .hdel(keys::STREAM_OBSERVERS, user.as_str())
            .await
    }

    /// Live streams. Unreadable records and streams whose presenter session
    /// is gone are left out.
    pub async fn stream_list(&self) -> Result<Vec<StreamSummary>, OrchestratorError> {
        let mut summaries = Vec::new();
        for field in self.streams.list_fields().await? {
            let Ok(id) = field.parse::<StreamId>() else {
                continue;
            };
            let Ok(stream) = self.streams.load(id).await else {
                continue;
            };
            let Some(presenter) = stream.presenter else {
                continue;
            };
            if !self.users.exists(&presenter.id).await? {
                continue;
            }
            summaries.push(StreamSummary {
                id: stream.id,
                client: presenter.client.clone(),
                started: stream.started,
                presenter: Some(presenter),
                viewer: stream.viewer,
                sdp_offer: stream.sdp_offer,
            });
        }
        Ok(summaries)
    }

    /// Push the stream list to every observer. Returns the observer count.
    pub async fn broadcast_stream_list(&self) -> Result<usize, OrchestratorError> {
        let observers = self.store.hgetall(keys::STREAM_OBSERVERS).await?;
        if observers.is_empty() {
            return Ok(0);
        }

        let streams = self.stream_list().await?;
        for socket in observers.values() {
            self.notifier.send(
                socket,
                ClientEvent::StreamList {
                    streams: streams.clone(),
                },
            );
        }
        Ok(observers.len())
    }
}
