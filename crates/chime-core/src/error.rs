//! Error types for the hub.

use thiserror::Error;

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur while running the hub
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raised by config validation with every missing field at once.
    #[error("Configuration is missing required fields: {}", .0.join(", "))]
    MissingConfigFields(Vec<String>),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Core at {path} could not be identified: {reason}")]
    CoreIdentify { path: String, reason: String },

    #[error("Core {path} was found, but is not executable by its owner")]
    CoreNotExecutable { path: String },

    #[error("Failed to launch core {id}: {reason}")]
    CoreLaunch { id: String, reason: String },

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
