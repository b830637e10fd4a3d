//! Participant roles within a relay room.
//!
//! A device can act in several roles in the same room at once (publish its
//! own feed and subscribe to others'), so each role gets its own relay
//! session/handle pair keyed by [`Role::credential_key`].

use crate::errors::OrchestratorError;
use std::fmt;

/// Credential key for the publisher role.
pub const PUBLISHER_KEY: &str = "0";

/// Credential key for the reserved service role used to list participants.
pub const SERVICE_KEY: &str = "-1";

/// Role of a device within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends media.
    Publisher,
    /// Receives one publisher's feed. `feed_ref` is the client-supplied
    /// composite `<subscriberId>-<callId>-<publisherId>`.
    Subscriber { feed_ref: String },
    /// Signaling-server-owned attachment for participant queries.
    Service,
}

impl Role {
    /// Role from an optional client-supplied publisher reference.
    /// Absent, empty and `"0"` mean the caller publishes.
    #[must_use]
    pub fn from_publisher_ref(publisher_ref: Option<&str>) -> Self {
        match publisher_ref.map(str::trim) {
            None | Some("" | PUBLISHER_KEY) => Role::Publisher,
            Some(SERVICE_KEY) => Role::Service,
            Some(feed_ref) => Role::Subscriber {
                feed_ref: feed_ref.to_string(),
            },
        }
    }

    /// Key of this role in a user's relay credential map.
    #[must_use]
    pub fn credential_key(&self) -> &str {
        match self {
            Role::Publisher => PUBLISHER_KEY,
            Role::Service => SERVICE_KEY,
            Role::Subscriber { feed_ref } => feed_ref,
        }
    }

    /// Relay publisher id this subscriber wants to receive: the trailing
    /// numeric component of the composite reference.
    ///
    /// # Errors
    ///
    /// `Validation("publisherId")` when the role is not a subscriber or the
    /// reference has no trailing digits.
    pub fn feed(&self) -> Result<u64, OrchestratorError> {
        let Role::Subscriber { feed_ref } = self else {
            return Err(OrchestratorError::Validation("publisherId".to_string()));
        };

        let digits_start = feed_ref
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(idx, _)| idx);

        digits_start
            .and_then(|idx| feed_ref.get(idx..))
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| OrchestratorError::Validation("publisherId".to_string()))
    }

    #[must_use]
    pub fn is_publisher(&self) -> bool {
        matches!(self, Role::Publisher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Service => f.write_str("service"),
            Role::Subscriber { feed_ref } => write!(f, "subscriber:{feed_ref}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_publisher_ref() {
        assert_eq!(Role::from_publisher_ref(None), Role::Publisher);
        assert_eq!(Role::from_publisher_ref(Some("0")), Role::Publisher);
        assert_eq!(Role::from_publisher_ref(Some("")), Role::Publisher);
        assert_eq!(Role::from_publisher_ref(Some("-1")), Role::Service);
        assert_eq!(
            Role::from_publisher_ref(Some("3-9-1234")),
            Role::Subscriber {
                feed_ref: "3-9-1234".to_string()
            }
        );
    }

    #[test]
    fn test_feed_is_trailing_digits() {
        let role = Role::from_publisher_ref(Some("77-2-4815162342"));
        assert_eq!(role.feed().unwrap(), 4_815_162_342);

        let bare = Role::from_publisher_ref(Some("991"));
        assert_eq!(bare.feed().unwrap(), 991);
    }

    #[test]
    fn test_feed_without_trailing_digits_is_rejected() {
        let role = Role::from_publisher_ref(Some("77-2-abc"));
        assert!(matches!(
            role.feed(),
            Err(OrchestratorError::Validation(field)) if field == "publisherId"
        ));

        assert!(Role::Publisher.feed().is_err());
    }

    #[test]
    fn test_credential_keys() {
        assert_eq!(Role::Publisher.credential_key(), "0");
        assert_eq!(Role::Service.credential_key(), "-1");
        assert_eq!(
            Role::from_publisher_ref(Some("1-2-3")).credential_key(),
            "1-2-3"
        );
    }
}
