//! Relay Orchestrator Library
//!
//! Signaling-side orchestration of a fleet of media relay instances (SFUs).
//! The library decides which relay instance serves each call, attaches
//! client devices to relay rooms, drives the per-participant relay event
//! loop, and manages the lifecycle of 1:1 screen-sharing streams.
//!
//! # Architecture
//!
//! ```text
//! StreamCoordinator (start / view / leave / destroy, ICE relay, reaper)
//! RelayOrchestrator (join, answer, trickle, media toggle, listeners)
//! ├── ConnectionManager (session + handle attach, bounded failover)
//! │   └── InstanceRegistry (shared registry, sticky pins, lowest load)
//! │       └── instance monitors (telemetry + event link per instance)
//! └── SessionEventEngine (one long-poll loop per room, device and role)
//!     └── PendingCallbacks (join, connected, candidates, publishers)
//! ```
//!
//! All cross-node state lives in the shared store behind
//! [`store::SharedStore`] and [`store::DistributedLock`]; the relay is
//! reached through [`relay::RelayClient`].
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing codes
//! - [`registry`] - Instance registry, selection policy and monitors
//! - [`connection`] - Relay connection manager
//! - [`session`] - Session event engine
//! - [`streams`] - Stream records and lifecycle
//! - [`orchestrator`] - Operations exposed to the command layer

pub mod config;
pub mod connection;
pub mod errors;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod relay;
pub mod role;
pub mod session;
pub mod store;
pub mod streams;
pub mod tasks;
pub mod users;
