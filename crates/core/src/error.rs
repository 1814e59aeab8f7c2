//! Startup error types.
//!
//! Configuration problems are fatal at startup only; nothing in the running
//! control loop produces them.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A constraint across config fields was violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
