//! Shared state store and distributed lock seam.
//!
//! Every orchestrator process shares one key/value store holding the
//! instance registry, room-id mapping, stream records and user sessions.
//! The registry is the only structure guarded by a distributed lock; all
//! other records are last-write-wins.
//!
//! # Keys
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `relay:instances` | string | instance registry (JSON) |
//! | `relay:room-ids` | hash | room key -> relay-native room id |
//! | `activeStream{id}` | string | stream record (JSON) |
//! | `streamList` | hash | stream id -> stream id |
//! | `lastUsedStreamId` | string | last allocated stream id |
//! | `authUser_{id}` | string | user session (JSON) |
//! | `userList` | hash | user id -> user id |
//! | `streamObservers` | hash | user id -> transport socket |

pub mod lua_scripts;
pub mod redis;

use crate::errors::OrchestratorError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use self::redis::RedisStore;

/// Store key names.
pub mod keys {
    use common::types::{StreamId, UserId};

    /// Serialized instance registry.
    pub const INSTANCE_REGISTRY: &str = "relay:instances";

    /// Lock guarding the instance registry.
    pub const INSTANCE_REGISTRY_LOCK: &str = "instance-registry-lock";

    /// Room key -> relay-native room id.
    pub const ROOM_IDS: &str = "relay:room-ids";

    /// Index of live stream records.
    pub const STREAM_LIST: &str = "streamList";

    /// Last allocated stream id.
    pub const LAST_USED_STREAM_ID: &str = "lastUsedStreamId";

    /// Index of live user sessions.
    pub const USER_LIST: &str = "userList";

    /// Stream-list subscribers.
    pub const STREAM_OBSERVERS: &str = "streamObservers";

    #[must_use]
    pub fn stream(id: StreamId) -> String {
        format!("activeStream{id}")
    }

    #[must_use]
    pub fn user(id: &UserId) -> String {
        format!("authUser_{id}")
    }
}

/// Key/value and hash operations on the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError>;

    async fn del(&self, key: &str) -> Result<(), OrchestratorError>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, OrchestratorError>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), OrchestratorError>;

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), OrchestratorError>;

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, OrchestratorError>;
}

/// A held distributed lock. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
}

/// Named distributed lock with a TTL.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `name` for at most `ttl`. Implementations may retry internally
    /// with jitter up to a bounded attempt count.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockHandle, OrchestratorError>;

    /// Release a lock previously returned by [`DistributedLock::acquire`].
    /// Releasing an expired lock is not an error.
    async fn release(&self, handle: &LockHandle) -> Result<(), OrchestratorError>;
}

#[cfg(test)]
mod tests {
    use super::keys;
    use common::types::{StreamId, UserId};

    #[test]
    fn test_record_keys() {
        assert_eq!(keys::stream(StreamId(17)), "activeStream17");
        assert_eq!(keys::user(&UserId::from("abc")), "authUser_abc");
    }
}
