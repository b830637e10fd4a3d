//! Relay orchestrator error types.
//!
//! Errors map to client-facing status codes for command responses.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Relay orchestrator error type.
///
/// Maps to client-facing status codes:
/// - `Validation`: 400
/// - `NotFound`: 404
/// - `Conflict`: 409
/// - `RelayUnavailable`: 503
/// - `RelayProtocol`, `Store`, `Config`, `Internal`: 500
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Room, stream, user or registry absent from the shared store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Slot already taken (e.g. the viewer slot of a 1:1 stream).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Relay control-channel call failed or returned a non-success response.
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Relay payload could not be parsed.
    #[error("Relay protocol error: {0}")]
    RelayProtocol(String),

    /// Shared store or distributed lock failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Required input field missing. Holds the field name.
    #[error("No {0} passed")]
    Validation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Returns the client-facing status code for this error.
    #[must_use]
    pub fn error_code(&self) -> u16 {
        match self {
            OrchestratorError::Validation(_) => 400,
            OrchestratorError::NotFound(_) => 404,
            OrchestratorError::Conflict(_) => 409,
            OrchestratorError::RelayUnavailable(_) => 503,
            OrchestratorError::RelayProtocol(_)
            | OrchestratorError::Store(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Internal(_) => 500,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            OrchestratorError::RelayProtocol(_)
            | OrchestratorError::Store(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Internal(_) => "An internal error occurred".to_string(),
            OrchestratorError::RelayUnavailable(_) => {
                "Media server is unavailable, please try again".to_string()
            }
            OrchestratorError::NotFound(what) => format!("Not found: {what}"),
            OrchestratorError::Validation(_) => self.to_string(),
            OrchestratorError::Conflict(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            OrchestratorError::Validation("sdpOffer".to_string()).error_code(),
            400
        );
        assert_eq!(
            OrchestratorError::NotFound("stream 7".to_string()).error_code(),
            404
        );
        assert_eq!(
            OrchestratorError::Conflict("viewer present".to_string()).error_code(),
            409
        );
        assert_eq!(
            OrchestratorError::RelayUnavailable("all down".to_string()).error_code(),
            503
        );

        assert_eq!(
            OrchestratorError::RelayProtocol("bad json".to_string()).error_code(),
            500
        );
        assert_eq!(
            OrchestratorError::Store("timeout".to_string()).error_code(),
            500
        );
        assert_eq!(
            OrchestratorError::Config("bad".to_string()).error_code(),
            500
        );
        assert_eq!(
            OrchestratorError::Internal("rng".to_string()).error_code(),
            500
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err =
            OrchestratorError::Store("connection refused at 10.0.0.12:6379".to_string());
        assert!(!store_err.client_message().contains("10.0.0.12"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let relay_err =
            OrchestratorError::RelayUnavailable("http://relay-1:8088 refused".to_string());
        assert!(!relay_err.client_message().contains("relay-1"));
    }

    #[test]
    fn test_validation_message_names_the_field() {
        let err = OrchestratorError::Validation("sdpOffer".to_string());
        assert_eq!(err.client_message(), "No sdpOffer passed");
    }

    #[test]
    fn test_conflict_message_is_passed_through() {
        let err = OrchestratorError::Conflict(
            "Somebody else is watching this stream now".to_string(),
        );
        assert_eq!(
            err.client_message(),
            "Somebody else is watching this stream now"
        );
        assert_eq!(
            format!("{err}"),
            "Conflict: Somebody else is watching this stream now"
        );
    }
}
