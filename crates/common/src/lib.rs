//! Common utilities and types shared across relay orchestrator components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
