//! Stream Lifecycle Coordinator: records, persistence, transitions, reaper.

pub mod coordinator;
pub mod model;
pub mod reaper;
pub mod repository;

pub use coordinator::StreamCoordinator;
pub use model::{Party, Participant, Stream};
pub use reaper::{run_reaper_cycle, ReapSummary};
pub use repository::{StreamEntry, StreamRepository};
