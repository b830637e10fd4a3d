//! User sessions.
//!
//! One session per transport connection. Besides identity, a session holds
//! the relay credentials the device acquired: for every room it is in and
//! every role it plays there, the relay session id and plugin handle id.

use crate::errors::OrchestratorError;
use crate::role::Role;
use crate::store::{keys, SharedStore};
use common::types::{DeviceId, RoomKey, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Relay session and plugin handle for one (room, role).
///
/// Meaningless unless both ids are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredential {
    pub session: Option<u64>,
    pub handle: Option<u64>,
}

impl RelayCredential {
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.session.is_some() && self.handle.is_some()
    }

    /// Control path for plugin messages, if attached.
    #[must_use]
    pub fn handle_path(&self) -> Option<String> {
        match (self.session, self.handle) {
            (Some(session), Some(handle)) => Some(format!("/janus/{session}/{handle}")),
            _ => None,
        }
    }
}

/// A connected client device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: UserId,
    pub ip: String,
    /// Transport socket used to push events to this client.
    pub socket: String,
    pub device: DeviceId,
    /// room key -> role credential key -> credential
    #[serde(default)]
    pub relay: BTreeMap<RoomKey, BTreeMap<String, RelayCredential>>,
}

impl UserSession {
    /// New session for a transport connection. The user id is the connection id.
    ///
    /// # Errors
    ///
    /// `Internal` if a device id cannot be generated.
    pub fn from_connection(connection_id: &str, ip: &str) -> Result<Self, OrchestratorError> {
        let device = DeviceId::generate()
            .map_err(|e| OrchestratorError::Internal(format!("device id: {e}")))?;

        Ok(Self {
            id: UserId::from(connection_id),
            ip: ip.to_string(),
            socket: connection_id.to_string(),
            device,
            relay: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn credential(&self, room: &RoomKey, role: &Role) -> Option<&RelayCredential> {
        self.relay.get(room)?.get(role.credential_key())
    }

    /// Credential entry for (room, role), created empty if absent.
    pub fn credential_mut(&mut self, room: &RoomKey, role: &Role) -> &mut RelayCredential {
        self.relay
            .entry(room.clone())
            .or_default()
            .entry(role.credential_key().to_string())
            .or_default()
    }

    /// Drop the credential for (room, role); drops the room entry when empty.
    pub fn clear_credential(&mut self, room: &RoomKey, role: &Role) {
        if let Some(roles) = self.relay.get_mut(room) {
            roles.remove(role.credential_key());
            if roles.is_empty() {
                self.relay.remove(room);
            }
        }
    }

    /// Control path for (room, role). `/janus/` when not attached.
    #[must_use]
    pub fn request_path(&self, room: &RoomKey, role: &Role) -> String {
        self.credential(room, role)
            .and_then(RelayCredential::handle_path)
            .unwrap_or_else(|| "/janus/".to_string())
    }
}

/// Persistence for user sessions.
#[derive(Clone)]
pub struct UserRepository {
    store: Arc<dyn SharedStore>,
}

impl UserRepository {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Create and persist a session for a new transport connection.
    #[instrument(skip_all, fields(user = %connection_id))]
    pub async fn create(
        &self,
        connection_id: &str,
        ip: &str,
    ) -> Result<UserSession, OrchestratorError> {
        let user = UserSession::from_connection(connection_id, ip)?;
        self.save(&user).await?;
        debug!(target: "ro.users", user = %user.id, device = %user.device, "User session created");
        Ok(user)
    }

    /// Load a session.
    ///
    /// # Errors
    ///
    /// `NotFound` when the session does not exist, `Store` when it is unreadable.
    pub async fn load(&self, id: &UserId) -> Result<UserSession, OrchestratorError> {
        let raw = self
            .store
            .get(&keys::user(id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("user {id}")))?;

        serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Store(format!("corrupt user record {id}: {e}")))
    }

    /// Whether a session exists.
    pub async fn exists(&self, id: &UserId) -> Result<bool, OrchestratorError> {
        Ok(self.store.get(&keys::user(id)).await?.is_some())
    }

    pub async fn save(&self, user: &UserSession) -> Result<(), OrchestratorError> {
        let raw = serde_json::to_string(user)
            .map_err(|e| OrchestratorError::Internal(format!("serialize user: {e}")))?;
        self.store.set(&keys::user(&user.id), &raw).await?;
        self.store
            .hset(keys::USER_LIST, user.id.as_str(), user.id.as_str())
            .await
    }

    /// Reload, mutate and persist a session.
    pub async fn update<F>(&self, id: &UserId, mutate: F) -> Result<UserSession, OrchestratorError>
    where
        F: FnOnce(&mut UserSession) + Send,
    {
        let mut user = self.load(id).await?;
        mutate(&mut user);
        self.save(&user).await?;
        Ok(user)
    }

    /// Remove a session on disconnect or logout. Also abandons any
    /// stream-list subscription.
    #[instrument(skip_all, fields(user = %id))]
    pub async fn delete(&self, id: &UserId) -> Result<(), OrchestratorError> {
        self.store.hdel(keys::STREAM_OBSERVERS, id.as_str()).await?;
        self.store.hdel(keys::USER_LIST, id.as_str()).await?;
        self.store.del(&keys::user(id)).await?;
        debug!(target: "ro.users", user = %id, "User session deleted");
        Ok(())
    }
}
