//! Background tasks.
//!
//! # Tasks
//!
//! - `stream_reaper` - Removes streams whose presenter is gone and frees
//!   viewer slots of departed viewers
//! - `stream_list_broadcaster` - Pushes the live stream list to observers
//! - `registry_gauges` - Publishes fleet health gauges from the registry
//!
//! Instance monitors live next to the registry in `registry::monitor`.

pub mod registry_gauges;
pub mod stream_list_broadcaster;
pub mod stream_reaper;

pub use registry_gauges::start_registry_gauges;
pub use stream_list_broadcaster::start_stream_list_broadcaster;
pub use stream_reaper::start_stream_reaper;
