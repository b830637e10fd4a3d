//! Relay protocol client.
//!
//! [`RelayClient`] is the seam between orchestration logic and the relay
//! fleet: a request/response control channel plus a long-pollable event
//! channel per relay session. [`HttpRelayClient`] is the production
//! implementation; tests substitute a scripted double.

pub mod http;
pub mod messages;

use crate::errors::OrchestratorError;
use crate::registry::RelayInstance;
use async_trait::async_trait;

pub use http::HttpRelayClient;
pub use messages::{
    Jsep, MediaFlags, MessageBody, RelayEvent, RelayRequest, RelayResponse, RoomParticipant,
    NO_SUCH_SESSION,
};

/// Control and event channels of a relay instance.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// POST `request` to `path` on `instance`'s control channel.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` on transport failure, a non-2xx status or an
    /// `error` answer; `RelayProtocol` if the answer cannot be parsed.
    async fn send(
        &self,
        instance: &RelayInstance,
        path: &str,
        request: &RelayRequest,
    ) -> Result<RelayResponse, OrchestratorError>;

    /// Long-poll the event channel of relay session `session`. Returns the
    /// raw event body, or `None` when the poll came back empty.
    async fn poll_event(
        &self,
        instance: &RelayInstance,
        session: u64,
    ) -> Result<Option<String>, OrchestratorError>;
}
