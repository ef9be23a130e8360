//! Error types for podbox-shim.

use podbox_core::ControllerError;
use thiserror::Error;

/// Result type alias for podbox-shim operations.
pub type Result<T> = std::result::Result<T, ShimError>;

/// Errors that can occur while driving pause processes.
#[derive(Debug, Error)]
pub enum ShimError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The pause command could not be spawned
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal failed
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::errno::Errno,
    },

    /// The process outlived every signal
    #[error("pid {0} did not exit after SIGKILL")]
    Unkillable(u32),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ShimError> for ControllerError {
    fn from(err: ShimError) -> Self {
        match err {
            ShimError::Io(e) => ControllerError::Io(e),
            other => ControllerError::Backend(other.to_string()),
        }
    }
}
