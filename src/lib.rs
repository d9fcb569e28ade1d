//! # plugin-sandbox
//!
//! Capability-gated sandbox host for running untrusted JavaScript plugins.
//!
//! Each execution gets a fresh isolation boundary with no ambient authority, a hard
//! memory ceiling and a wall-clock deadline. Network and filesystem access is only
//! reachable through bridges that consult the capability broker before any I/O.

pub mod config;
pub mod error;
pub mod logging;
pub mod plugin_isolation;

pub use config::SandboxConfig;
pub use error::{Error, Result};
pub use plugin_isolation::{
    ErrorKind, ExecutionLimits, ExecutionResult, PluginSandboxHost, RawManifest,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::InvalidConfiguration("test".to_string());
        assert!(err.to_string().contains("test"));
    }
}
