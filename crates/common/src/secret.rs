//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports [`secrecy`] types. Relay API secrets and store URLs (which may
//! embed credentials, e.g. `redis://:password@host:6379`) are held as
//! [`SecretString`] so that `Debug` output and tracing fields are redacted.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct RelayCredentials {
//!     host: String,
//!     api_secret: SecretString,
//! }
//!
//! let creds = RelayCredentials {
//!     host: "relay-1".to_string(),
//!     api_secret: SecretString::from("janusrocks"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("janusrocks"));
//! assert_eq!(creds.api_secret.expose_secret(), "janusrocks");
//! ```
//!
//! With the `serde` feature of `secrecy`, secrets deserialize directly from
//! configuration JSON.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
