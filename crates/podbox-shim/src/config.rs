//! Configuration for the pause-process backend.

use crate::error::{Result, ShimError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default pause command.
pub const DEFAULT_PAUSE_COMMAND: &[&str] = &["sleep", "infinity"];

/// Default wait after SIGKILL before giving up on a process.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Configuration for [`ShimController`](crate::ShimController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Argv of the long-lived process that stands in for the sandbox.
    pub pause_command: Vec<String>,
    /// Wait after SIGKILL before reporting the process as unkillable.
    pub kill_grace: Duration,
    /// Directory holding one bundle directory per sandbox.
    pub bundle_root: PathBuf,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            pause_command: DEFAULT_PAUSE_COMMAND.iter().map(|s| s.to_string()).collect(),
            kill_grace: DEFAULT_KILL_GRACE,
            bundle_root: PathBuf::from("/run/podbox/shim"),
        }
    }
}

impl ShimConfig {
    /// Create a configuration with default settings under `bundle_root`.
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            ..Default::default()
        }
    }

    /// Set the pause command argv.
    pub fn with_pause_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pause_command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Set the SIGKILL grace period.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if the pause command is empty or the grace period is zero.
    pub fn validate(&self) -> Result<()> {
        match self.pause_command.first() {
            None => return Err(ShimError::Config("pause_command cannot be empty".into())),
            Some(program) if program.is_empty() => {
                return Err(ShimError::Config("pause_command program cannot be empty".into()));
            }
            Some(_) => {}
        }
        if self.kill_grace.is_zero() {
            return Err(ShimError::Config("kill_grace must be greater than zero".into()));
        }
        if self.bundle_root.as_os_str().is_empty() {
            return Err(ShimError::Config("bundle_root cannot be empty".into()));
        }
        Ok(())
    }
}
