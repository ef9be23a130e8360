//! Configuration for the podbox daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use podbox_core::ManagerConfig;
use podbox_shim::{ShimConfig, DEFAULT_KILL_GRACE, DEFAULT_PAUSE_COMMAND};
use std::path::{Path, PathBuf};

/// Configuration for the podbox daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Persistent root; sandbox root directories live below it.
    pub root_path: PathBuf,

    /// Runtime state directory; sandbox documents and shim bundles live below it.
    pub state_path: PathBuf,

    /// Maximum number of live sandboxes (default: 100, 0 = unlimited).
    pub max_sandboxes: usize,

    /// Argv of the shim pause process.
    pub pause_command: Vec<String>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pause command is empty")]
    EmptyPauseCommand,

    #[error("pause program not found: {0}")]
    MissingPauseProgram(String),

    #[error("parent directory not found for {}", .0.display())]
    MissingParent(PathBuf),
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/podbox"),
            state_path: PathBuf::from("/run/podbox"),
            max_sandboxes: 100,
            pause_command: DEFAULT_PAUSE_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PODBOX_ROOT` | `/var/lib/podbox` |
    /// | `PODBOX_STATE` | `/run/podbox` |
    /// | `PODBOX_MAX_SANDBOXES` | `100` |
    /// | `PODBOX_PAUSE_COMMAND` | `sleep infinity` (whitespace separated) |
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let pause_command: Vec<String> = var("PODBOX_PAUSE_COMMAND")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .filter(|argv: &Vec<String>| !argv.is_empty())
            .unwrap_or(default.pause_command);

        Self {
            root_path: var("PODBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.root_path),
            state_path: var("PODBOX_STATE")
                .map(PathBuf::from)
                .unwrap_or(default.state_path),
            max_sandboxes: var("PODBOX_MAX_SANDBOXES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sandboxes),
            pause_command,
        }
    }

    /// Settings for the sandbox manager.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_sandboxes: self.max_sandboxes,
            ..ManagerConfig::new(self.root_path.clone(), self.state_path.clone())
        }
    }

    /// Settings for the shim backend; bundles live in `<state_path>/shim`.
    pub fn shim_config(&self) -> ShimConfig {
        ShimConfig::new(self.state_path.join("shim"))
            .with_pause_command(self.pause_command.iter().cloned())
            .with_kill_grace(DEFAULT_KILL_GRACE)
    }

    /// Validate the pause program and directory parents.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let program = self
            .pause_command
            .first()
            .ok_or(ConfigError::EmptyPauseCommand)?;
        if !program_exists(program) {
            return Err(ConfigError::MissingPauseProgram(program.clone()));
        }

        for path in [&self.root_path, &self.state_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(ConfigError::MissingParent(path.clone()));
                }
            }
        }
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
    }
}

/// Check whether `program` is a path to an existing file or resolvable on PATH.
fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
