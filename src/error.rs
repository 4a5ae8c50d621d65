//! Error handling module for vmsetup
//!
//! Provides centralized error handling with proper error types using thiserror.
//! The first four variants form the provisioning failure taxonomy; the rest
//! are plumbing that the engine classifies before a step boundary is crossed.

use std::time::Duration;
use thiserror::Error;

/// Main error type for vmsetup
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The target user could not be determined (always fatal)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid or duplicate step registration, bad config file (fatal, caught at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step's action failed after recovery and retry
    #[error("Step '{step}' failed: {reason}")]
    StepFailure { step: String, reason: String },

    /// A candidate file was rejected by its validator and rolled back
    #[error("Validation failed: {0}")]
    Validation(String),

    /// External command could not be run or exited non-zero
    #[error("Command failed: {0}")]
    Command(String),

    /// External command exceeded its wall-clock limit
    #[error("Command '{program}' timed out after {limit:?}")]
    Timeout { program: String, limit: Duration },

    /// IO errors (file operations, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for vmsetup operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create an identity error
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a step failure
    pub fn step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepFailure {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::config("duplicate step name 'apt-update'");
        assert_eq!(
            err.to_string(),
            "Configuration error: duplicate step name 'apt-update'"
        );

        let err = ProvisionError::step("clone:impacket", "network unreachable");
        assert_eq!(
            err.to_string(),
            "Step 'clone:impacket' failed: network unreachable"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = ProvisionError::Timeout {
            program: "apt-get".to_string(),
            limit: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "Command 'apt-get' timed out after 90s");

        let err = ProvisionError::Timeout {
            program: "sh".to_string(),
            limit: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "Command 'sh' timed out after 500ms");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
    }
}
