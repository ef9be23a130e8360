//! Error types for podbox-core.

use crate::controller::ControllerError;
use crate::SandboxId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for podbox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The backend rejected or failed the operation
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    /// No controller is registered under the sandboxer name
    #[error("no controller registered for sandboxer {0:?}")]
    UnknownSandboxer(String),

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// Another live sandbox already uses this name
    #[error("sandbox name already in use: {0}")]
    NameConflict(String),

    /// Another live sandbox already uses this id
    #[error("sandbox id already in use: {0}")]
    IdConflict(SandboxId),

    /// The manager refuses to track more sandboxes
    #[error("max sandbox limit reached ({0})")]
    LimitReached(usize),

    /// Invalid sandbox state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// A removal of this sandbox is in flight or has completed
    #[error("sandbox {0} is being removed")]
    RemovalInProgress(SandboxId),

    /// Sandbox configuration failed validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Network settings were not a JSON document
    #[error("invalid network settings: {0}")]
    InvalidNetworkSettings(String),

    /// Reading or writing one of the persisted documents failed
    #[error("failed to persist {}: {source}", .path.display())]
    Persist {
        /// Document path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }
}
