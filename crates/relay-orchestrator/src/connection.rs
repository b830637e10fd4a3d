//! Relay Connection Manager.
//!
//! Attaches a (room, device, role) to a relay instance: create a relay
//! session, attach a videoroom handle, store both ids on the user's
//! credential map. A relay failure during attach marks the instance down,
//! clears the room's pin and retries against a freshly selected instance.
//! Attempts are bounded by `1 + connected instances` (at least 2).

use crate::errors::OrchestratorError;
use crate::observability::metrics;
use crate::registry::{InstanceRegistry, RelayInstance};
use crate::relay::{MessageBody, RelayClient, RelayRequest, RelayResponse, RoomParticipant};
use crate::role::Role;
use crate::store::{keys, SharedStore};
use crate::streams::StreamRepository;
use crate::users::{RelayCredential, UserRepository};
use common::types::{RoomKey, UserId};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Range of relay-native room ids. Collisions are tolerated.
pub const ROOM_ID_RANGE: RangeInclusive<u64> = 10_000_000..=99_999_999;

/// Base backoff between attach attempts, multiplied by the attempt number.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Establishes and addresses relay attachments.
pub struct ConnectionManager {
    store: Arc<dyn SharedStore>,
    relay: Arc<dyn RelayClient>,
    registry: Arc<InstanceRegistry>,
    users: UserRepository,
    streams: StreamRepository,
    retry_backoff: Duration,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        relay: Arc<dyn RelayClient>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            users: UserRepository::new(Arc::clone(&store)),
            streams: StreamRepository::new(Arc::clone(&store)),
            store,
            relay,
            registry,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Attach `user` to `room` as `role` and return the serving instance.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` once every attempt failed, `NotFound` if the user
    /// session is gone, `Store` on store failure.
    #[instrument(skip_all, fields(room = %room, user = %user, role = %role))]
    pub async fn create_connection(
        &self,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
    ) -> Result<RelayInstance, OrchestratorError> {
        let connected = self.registry.connected_count().await;
        let max_attempts = u32::try_from(connected)
            .unwrap_or(u32::MAX)
            .saturating_add(1)
            .max(2);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            // A new attach always reselects.
            self.registry.invalidate_room(room).await;
            let instance = self.registry.select_instance_for_room(room).await?;

            match self.attach(&instance, room, user, role).await {
                Ok(credential) => {
                    info!(
                        target: "ro.connection",
                        room = %room,
                        host = %instance.host,
                        session = ?credential.session,
                        attempt,
                        "Relay connection established"
                    );
                    return Ok(instance);
                }
                Err(OrchestratorError::RelayUnavailable(reason)) => {
                    warn!(
                        target: "ro.connection",
                        room = %room,
                        host = %instance.host,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "Relay attach failed, failing over"
                    );
                    metrics::record_connection_failover();
                    self.fail_over(room, &instance.host).await;
                    last_error = reason;

                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::RelayUnavailable(format!(
            "no relay instance accepted room {room} after {max_attempts} attempts: {last_error}"
        )))
    }

    async fn attach(
        &self,
        instance: &RelayInstance,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
    ) -> Result<RelayCredential, OrchestratorError> {
        let session = self
            .relay
            .send(instance, "/janus", &RelayRequest::create_session())
            .await?
            .created_id()?;
        let handle = self
            .relay
            .send(instance, &format!("/janus/{session}"), &RelayRequest::attach())
            .await?
            .created_id()?;

        let credential = RelayCredential {
            session: Some(session),
            handle: Some(handle),
        };
        let stored = credential.clone();
        self.users
            .update(user, move |u| *u.credential_mut(room, role) = stored)
            .await?;
        Ok(credential)
    }

    /// Mark the instance down and drop the room's placement.
    async fn fail_over(&self, room: &RoomKey, host: &str) {
        if let Err(e) = self.registry.mark_disconnected(host).await {
            warn!(target: "ro.connection", host = %host, error = %e, "Failed to mark instance down");
        }
        self.registry.invalidate_room(room).await;
        if let Some(id) = room.stream_id() {
            if let Err(e) = self.streams.clear_pin(id).await {
                warn!(target: "ro.connection", room = %room, error = %e, "Failed to clear instance pin");
            }
        }
    }

    /// Relay-native numeric id for `room`, generated on first use.
    pub async fn room_id_for(&self, room: &RoomKey) -> Result<u64, OrchestratorError> {
        let existing = self
            .store
            .hget(keys::ROOM_IDS, room.as_str())
            .await?
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|id| *id != 0);
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = rand::thread_rng().gen_range(ROOM_ID_RANGE);
        self.store
            .hset(keys::ROOM_IDS, room.as_str(), &id.to_string())
            .await?;
        debug!(target: "ro.connection", room = %room, room_id = id, "Assigned relay room id");
        Ok(id)
    }

    /// Control path for (user, room, role); `/janus/` when not attached.
    pub async fn request_path(
        &self,
        user: &UserId,
        room: &RoomKey,
        role: &Role,
    ) -> Result<String, OrchestratorError> {
        Ok(self.users.load(user).await?.request_path(room, role))
    }

    /// Send `request` on the user's handle for (room, role), to the room's instance.
    pub async fn send_as(
        &self,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
        request: &RelayRequest,
    ) -> Result<RelayResponse, OrchestratorError> {
        let instance = self.registry.select_instance_for_room(room).await?;
        let path = self.request_path(user, room, role).await?;
        self.relay.send(&instance, &path, request).await
    }

    /// Create the relay room unless it already exists.
    #[instrument(skip_all, fields(room = %room))]
    pub async fn ensure_room_exists(
        &self,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
    ) -> Result<(), OrchestratorError> {
        let room_id = self.room_id_for(room).await?;

        let exists = self
            .send_as(room, user, role, &RelayRequest::message(MessageBody::Exists { room: room_id }))
            .await?;
        if exists.room_exists() {
            debug!(target: "ro.connection", room = %room, room_id, "Relay room exists");
            return Ok(());
        }

        self.send_as(
            room,
            user,
            role,
            &RelayRequest::message(MessageBody::create_room(room_id)),
        )
        .await?;
        info!(target: "ro.connection", room = %room, room_id, "Relay room created");
        Ok(())
    }

    /// Live participants of the room, asked through the user's handle.
    pub async fn list_participants(
        &self,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
    ) -> Result<Vec<RoomParticipant>, OrchestratorError> {
        let room_id = self.room_id_for(room).await?;
        let answer = self
            .send_as(
                room,
                user,
                role,
                &RelayRequest::message(MessageBody::ListParticipants { room: room_id }),
            )
            .await?;
        Ok(answer.participants())
    }

    pub async fn destroy_room(
        &self,
        room: &RoomKey,
        user: &UserId,
        role: &Role,
    ) -> Result<(), OrchestratorError> {
        let room_id = self.room_id_for(room).await?;
        self.send_as(
            room,
            user,
            role,
            &RelayRequest::message(MessageBody::Destroy { room: room_id }),
        )
        .await?;
        info!(target: "ro.connection", room = %room, room_id, "Relay room destroyed");
        Ok(())
    }

    /// Hang up the user's publisher handle in `room`.
    pub async fn finish_stream(&self, room: &RoomKey, user: &UserId) -> Result<(), OrchestratorError> {
        self.send_as(
            room,
            user,
            &Role::Publisher,
            &RelayRequest::message(MessageBody::Leave),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_range_is_eight_digits() {
        assert_eq!(ROOM_ID_RANGE.start().to_string().len(), 8);
        assert_eq!(ROOM_ID_RANGE.end().to_string().len(), 8);
        for _ in 0..100 {
            let id = rand::thread_rng().gen_range(ROOM_ID_RANGE);
            assert!(ROOM_ID_RANGE.contains(&id));
        }
    }
}
