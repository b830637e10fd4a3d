//! Identifier types for streams, rooms, users and devices.

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of random bytes behind opaque identifiers (device ids, stream hashes).
pub const OPAQUE_ID_BYTES: usize = 16;

/// Failed to produce an opaque identifier.
#[derive(Debug, Error)]
#[error("Failed to generate random bytes")]
pub struct RandomIdError;

/// Generate a hex-encoded opaque identifier from [`OPAQUE_ID_BYTES`] CSPRNG bytes.
///
/// # Errors
///
/// Returns [`RandomIdError`] if the system CSPRNG fails.
pub fn random_hex_id() -> Result<String, RandomIdError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; OPAQUE_ID_BYTES];
    rng.fill(&mut bytes).map_err(|_| RandomIdError)?;
    Ok(hex::encode(bytes))
}

/// Store-assigned, monotonically increasing stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl StreamId {
    /// The identifier following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Logical room key. One room per stream, keyed by the stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Room key for a stream.
    #[must_use]
    pub fn for_stream(stream_id: StreamId) -> Self {
        Self(stream_id.to_string())
    }

    /// The stream this room belongs to, if the key is a stream id.
    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.0.parse().ok()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User identifier. Equal to the transport connection id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Device identifier, generated once per transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Generate a new random device id.
    ///
    /// # Errors
    ///
    /// Returns [`RandomIdError`] if the system CSPRNG fails.
    pub fn generate() -> Result<Self, RandomIdError> {
        random_hex_id().map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_id_length_and_uniqueness() {
        let a = random_hex_id().unwrap();
        let b = random_hex_id().unwrap();

        assert_eq!(a.len(), OPAQUE_ID_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_room_key_maps_back_to_stream() {
        let key = RoomKey::for_stream(StreamId(42));
        assert_eq!(key.as_str(), "42");
        assert_eq!(key.stream_id(), Some(StreamId(42)));
    }

    #[test]
    fn test_stream_id_parse_and_next() {
        let id: StreamId = " 7 ".parse().unwrap();
        assert_eq!(id, StreamId(7));
        assert_eq!(id.next(), StreamId(8));
        assert!("abc".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&UserId::from("socket-1")).unwrap();
        assert_eq!(json, "\"socket-1\"");

        let id: StreamId = serde_json::from_str("12").unwrap();
        assert_eq!(id, StreamId(12));
    }
}
