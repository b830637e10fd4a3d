//! # Relay Orchestrator Test Utilities
//!
//! In-memory doubles for the orchestrator's seams, for tests that run
//! without Redis or a relay fleet.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory shared store and distributed lock
//! - `mock_relay` - Scripted relay control and event channels
//! - `fixtures` - Instance configs, users and streams
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = MockStore::new();
//!     let relay = MockRelay::new();
//!     let configs = vec![instance_config("h1"), instance_config("h2")];
//!     seed_registry(&store, &[instance("h1", 10, true), instance("h2", 5, true)]);
//!
//!     let registry = registry_for(&store, &configs);
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod mock_relay;
pub mod mock_store;

pub use fixtures::*;
pub use mock_relay::*;
pub use mock_store::*;
