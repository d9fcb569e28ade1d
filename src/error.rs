//! Error types for the plugin sandbox host.

use thiserror::Error;

use crate::plugin_isolation::isolation_engine::BoundaryError;
use crate::plugin_isolation::manifest::ManifestError;

/// Result type alias for sandbox host operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sandbox host operations
///
/// These are host-side failures (configuration, HTTP client setup). Failures of a
/// single plugin execution never surface as `Error`; they are returned as
/// [`crate::plugin_isolation::ExecutionResult::Failure`].
#[derive(Debug, Error)]
pub enum Error {
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Manifest validation error
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Isolation boundary error
    #[error("Isolation error: {0}")]
    Isolation(#[from] BoundaryError),
}
