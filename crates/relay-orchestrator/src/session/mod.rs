//! Session Event Engine.

pub mod callbacks;
pub mod engine;

pub use callbacks::{CandidateEvent, JoinOutcome, PendingCallbacks};
pub use engine::{SessionEventEngine, SessionKey};
