//! Sandbox manager - the daemon's live set of sandboxes.

use crate::controller::ControllerManager;
use crate::error::CoreError;
use crate::persist::list_persisted;
use crate::sandbox::{Sandbox, SandboxId, SandboxParams};
use crate::state::SandboxStatus;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration for SandboxManager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Daemon root; sandbox root dirs live under `<root_path>/sandboxes`.
    pub root_path: PathBuf,
    /// Daemon state dir; sandbox documents live under `<state_path>/sandboxes`.
    pub state_path: PathBuf,
    /// Maximum number of live sandboxes (default: 100, 0 = unlimited).
    pub max_sandboxes: usize,
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new(root_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            state_path: state_path.into(),
            max_sandboxes: 100,
        }
    }

    /// Parent of every sandbox root dir.
    pub fn sandbox_root_base(&self) -> PathBuf {
        self.root_path.join("sandboxes")
    }

    /// Parent of every sandbox state dir.
    pub fn sandbox_state_base(&self) -> PathBuf {
        self.state_path.join("sandboxes")
    }
}

/// Tracks the sandboxes the daemon knows about.
///
/// The SandboxManager creates sandboxes, hands out shared handles to them,
/// drops them once removal succeeds, and rebuilds the set from disk at
/// startup.
///
/// # Thread Safety
///
/// The registry sits behind an async RwLock. Lifecycle calls on a sandbox
/// run outside that lock, so a slow backend never blocks lookups.
pub struct SandboxManager {
    sandboxes: Arc<RwLock<HashMap<SandboxId, Arc<Sandbox>>>>,
    controllers: Arc<ControllerManager>,
    config: ManagerConfig,
}

impl SandboxManager {
    /// Create a new sandbox manager.
    pub fn new(config: ManagerConfig, controllers: Arc<ControllerManager>) -> Self {
        tracing::info!(
            root = %config.root_path.display(),
            state = %config.state_path.display(),
            sandboxers = ?controllers.names(),
            "Creating sandbox manager"
        );
        Self {
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
            controllers,
            config,
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn controllers(&self) -> &ControllerManager {
        &self.controllers
    }

    /// Construct and create a new sandbox, then track it.
    ///
    /// If creation fails the partially created sandbox is torn down before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit is reached, the id or name is taken,
    /// the sandboxer is unknown or the create itself fails.
    pub async fn create(&self, mut params: SandboxParams) -> Result<Arc<Sandbox>, CoreError> {
        let id = params.id.get_or_insert_with(SandboxId::new).clone();
        if params.name.is_empty() {
            params.name = params.config.name.clone();
        }

        // Conflicts are checked before construction, which registers the
        // exit callback under the id. The entry reserves id and name while
        // the create runs.
        let sandbox = {
            let mut sandboxes = self.sandboxes.write().await;
            if self.config.max_sandboxes > 0 && sandboxes.len() >= self.config.max_sandboxes {
                return Err(CoreError::LimitReached(self.config.max_sandboxes));
            }
            if sandboxes.contains_key(&id) {
                return Err(CoreError::IdConflict(id));
            }
            if sandboxes.values().any(|s| s.name() == params.name) {
                return Err(CoreError::NameConflict(params.name));
            }
            let sandbox = Sandbox::new(
                params,
                &self.config.sandbox_root_base(),
                &self.config.sandbox_state_base(),
                &self.controllers,
            )?;
            sandboxes.insert(id, Arc::clone(&sandbox));
            sandbox
        };

        if let Err(e) = sandbox.create().await {
            tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Create failed, cleaning up");
            self.cleanup_failed_create(&sandbox).await;
            self.sandboxes.write().await.remove(sandbox.id());
            return Err(e);
        }

        tracing::info!(sandbox_id = %sandbox.id(), name = %sandbox.name(), "Sandbox registered");
        Ok(sandbox)
    }

    async fn cleanup_failed_create(&self, sandbox: &Sandbox) {
        if sandbox.state().status() != SandboxStatus::Unknown {
            // The backend has it; let remove release both sides.
            if let Err(e) = sandbox.remove(true).await {
                tracing::error!(sandbox_id = %sandbox.id(), error = %e, "Failed to remove half-created sandbox");
            }
            return;
        }
        for dir in [sandbox.statedir(), sandbox.rootdir()] {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove sandbox directory");
                }
            }
        }
    }

    /// Get a sandbox by id.
    pub async fn get(&self, id: &SandboxId) -> Result<Arc<Sandbox>, CoreError> {
        let sandboxes = self.sandboxes.read().await;
        sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.clone()))
    }

    /// Get a sandbox by name.
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Sandbox>> {
        let sandboxes = self.sandboxes.read().await;
        sandboxes.values().find(|s| s.name() == name).cloned()
    }

    /// Check if a sandbox exists.
    pub async fn exists(&self, id: &SandboxId) -> bool {
        let sandboxes = self.sandboxes.read().await;
        sandboxes.contains_key(id)
    }

    /// List all sandbox IDs, sorted.
    pub async fn list(&self) -> Vec<SandboxId> {
        let sandboxes = self.sandboxes.read().await;
        let mut ids: Vec<SandboxId> = sandboxes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get the number of live sandboxes.
    pub async fn count(&self) -> usize {
        let sandboxes = self.sandboxes.read().await;
        sandboxes.len()
    }

    pub async fn start(&self, id: &SandboxId) -> Result<(), CoreError> {
        self.get(id).await?.start().await
    }

    pub async fn stop(&self, id: &SandboxId, timeout: Option<Duration>) -> Result<(), CoreError> {
        self.get(id).await?.stop(timeout).await
    }

    /// Remove a sandbox and stop tracking it once removal succeeds.
    pub async fn remove(&self, id: &SandboxId, force: bool) -> Result<(), CoreError> {
        let sandbox = self.get(id).await?;
        sandbox.remove(force).await?;

        let mut sandboxes = self.sandboxes.write().await;
        sandboxes.remove(id);
        tracing::info!(sandbox_id = %id, "Sandbox unregistered");
        Ok(())
    }

    /// Rebuild the live set from disk and reconcile every sandbox.
    ///
    /// Sandboxes that fail to load are skipped; reconciliation failures are
    /// logged and the sandbox keeps its persisted status.
    ///
    /// # Returns
    ///
    /// The number of sandboxes restored.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let root_base = self.config.sandbox_root_base();
        let state_base = self.config.sandbox_state_base();
        let ids = list_persisted(&state_base).await?;
        tracing::info!(count = ids.len(), state = %state_base.display(), "Restoring sandboxes");

        let mut restored = Vec::with_capacity(ids.len());
        for id in ids {
            if self.exists(&id).await {
                continue;
            }
            match Sandbox::load(&id, &root_base, &state_base, &self.controllers).await {
                Ok(sandbox) => {
                    self.sandboxes
                        .write()
                        .await
                        .insert(id.clone(), Arc::clone(&sandbox));
                    restored.push(sandbox);
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %id, error = %e, "Failed to load sandbox");
                }
            }
        }

        for sandbox in &restored {
            if let Err(e) = sandbox.update_status().await {
                tracing::warn!(
                    sandbox_id = %sandbox.id(),
                    status = %sandbox.state().status(),
                    error = %e,
                    "Failed to reconcile sandbox with backend"
                );
            }
        }

        tracing::info!(count = restored.len(), "Sandboxes restored");
        Ok(restored.len())
    }
}
