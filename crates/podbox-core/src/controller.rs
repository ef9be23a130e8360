//! Backend contract for sandbox lifecycle operations.
//!
//! A [`Controller`] does the privileged work for one sandbox technology
//! (a pause process, a microVM, ...). Sandboxes resolve theirs by sandboxer
//! name through a [`ControllerManager`] once, at construction.

use crate::config::SandboxConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a controller backend.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The backend has no record of the sandbox
    #[error("sandbox {0} not found in backend")]
    NotFound(String),

    /// The backend cannot perform the operation in its current state
    #[error("backend state: {0}")]
    InvalidState(String),

    /// The backend operation failed
    #[error("backend failure: {0}")]
    Backend(String),

    /// I/O error inside the backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to create a sandbox.
#[derive(Debug, Clone)]
pub struct ControllerCreateParams {
    pub config: Arc<SandboxConfig>,
    pub runtime_handler: String,
    pub netns_path: String,
    pub rootdir: PathBuf,
    pub statedir: PathBuf,
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSandboxInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub task_address: String,
}

/// How and when the sandbox's main process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerExitInfo {
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

/// Backend view of whether the sandbox is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerSandboxState {
    Ready,
    NotReady,
    Unknown,
}

/// Authoritative status reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSandboxStatus {
    pub id: String,
    pub pid: u32,
    pub state: ControllerSandboxState,
    pub task_address: String,
    pub created_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_status: u32,
    /// Free-form backend details, filled when `verbose` was requested.
    pub info: BTreeMap<String, String>,
}

/// Receiver of unsolicited sandbox exits.
#[async_trait]
pub trait SandboxExitCallback: Send + Sync {
    async fn on_sandbox_exit(&self, exit: ControllerExitInfo);
}

/// Lifecycle operations one backend technology provides.
///
/// All lifecycle calls for a sandbox are serialized by the sandbox. The
/// exit callback takes that same serialization, so a backend must deliver
/// it from its own task and never await it inside a lifecycle call.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn create(
        &self,
        sandbox_id: &str,
        params: &ControllerCreateParams,
    ) -> Result<(), ControllerError>;

    async fn start(&self, sandbox_id: &str) -> Result<ControllerSandboxInfo, ControllerError>;

    /// Stop gracefully within `timeout`, escalating to a forced kill after.
    async fn stop(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> Result<ControllerExitInfo, ControllerError>;

    async fn remove(&self, sandbox_id: &str, force: bool) -> Result<(), ControllerError>;

    async fn status(
        &self,
        sandbox_id: &str,
        verbose: bool,
    ) -> Result<ControllerSandboxStatus, ControllerError>;

    /// Register the exit callback for a sandbox. Replaces any earlier one.
    fn watch_exit(&self, sandbox_id: &str, callback: Weak<dyn SandboxExitCallback>);
}

/// Registry of controllers keyed by sandboxer name.
#[derive(Default, Clone)]
pub struct ControllerManager {
    controllers: HashMap<String, Arc<dyn Controller>>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller, replacing any previous one with the same name.
    pub fn register(&mut self, sandboxer: impl Into<String>, controller: Arc<dyn Controller>) {
        let sandboxer = sandboxer.into();
        tracing::debug!(sandboxer = %sandboxer, "Registering controller");
        self.controllers.insert(sandboxer, controller);
    }

    pub fn with_controller(
        mut self,
        sandboxer: impl Into<String>,
        controller: Arc<dyn Controller>,
    ) -> Self {
        self.register(sandboxer, controller);
        self
    }

    pub fn get(&self, sandboxer: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.get(sandboxer).cloned()
    }

    pub fn contains(&self, sandboxer: &str) -> bool {
        self.controllers.contains_key(sandboxer)
    }

    /// Registered sandboxer names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controllers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("sandboxers", &self.names())
            .finish()
    }
}
