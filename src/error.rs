//! Error handling module for the provisioning orchestrator
//!
//! Only conditions that abort the whole run are represented here. Everything that
//! happens to an individual task is contained by the supervisor and reported as a
//! [`crate::supervisor::TaskOutcome`] instead.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors for a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The orchestrator must run with EUID 0
    #[error("Root privileges are required for provisioning steps")]
    NotRoot,

    /// Neither CLI, environment nor os-release yielded a distro identifier
    #[error("Unable to determine distro identifier")]
    MissingDistro,

    /// The task tree has no directory for the requested distro
    #[error("No configuration available for distro '{distro}' (expected {})", path.display())]
    DistroDirMissing { distro: String, path: PathBuf },

    /// The final mount specification lacks a `/` entry
    #[error("Mount specification does not contain a root (/) mount")]
    MissingRootMount,

    /// Configuration errors (invalid values that cannot be ignored)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error. Every fatal condition maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
