//! Sandbox type - one pod sandbox and its lifecycle.

use crate::config::SandboxConfig;
use crate::controller::{
    Controller, ControllerCreateParams, ControllerError, ControllerExitInfo,
    ControllerManager, ControllerSandboxState, ControllerSandboxStatus, SandboxExitCallback,
};
use crate::error::{CoreError, Result};
use crate::state::{SandboxState, SandboxStatus, StateSnapshot, StatsInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Graceful stop budget when the caller gives none. Matches containerd and cri-o.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const HOSTS_TEMPLATE: &str = "127.0.0.1\tlocalhost\n\
                              ::1\tlocalhost ip6-localhost ip6-loopback\n\
                              fe00::0\tip6-localnet\n\
                              ff00::0\tip6-mcastprefix\n\
                              ff02::1\tip6-allnodes\n\
                              ff02::2\tip6-allrouters\n";

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Create a new random 64-character hex sandbox ID.
    pub fn new() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    /// Wrap an existing ID.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ID names directories, so it must be a single path component.
    pub(crate) fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
            return Err(CoreError::InvalidConfig(format!("invalid sandbox id {:?}", id)));
        }
        Ok(())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Parameters for constructing a new sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxParams {
    /// Fixed ID; a random one is generated when `None`.
    pub id: Option<SandboxId>,
    /// Sandbox name; the config name is used when empty.
    pub name: String,
    /// Backend family, resolved through the [`ControllerManager`].
    pub sandboxer: String,
    /// Backend variant passed through to the controller.
    pub runtime_handler: String,
    /// Network namespace path prepared by the network layer.
    pub netns_path: String,
    /// Creation request snapshot.
    pub config: SandboxConfig,
}

/// Immutable point-in-time view of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSnapshot {
    pub id: SandboxId,
    pub name: String,
    pub sandboxer: String,
    pub runtime_handler: String,
    pub pid: u32,
    pub status: SandboxStatus,
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_status: u32,
    pub task_address: String,
    pub netns_path: String,
    pub network_ready: bool,
    pub containers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Mutable non-status fields, guarded together.
#[derive(Debug, Default)]
pub(crate) struct SandboxFields {
    pub(crate) task_address: String,
    pub(crate) netns_path: String,
    pub(crate) network_ready: bool,
    pub(crate) network_settings: String,
    pub(crate) containers: Vec<String>,
    pub(crate) config: Arc<SandboxConfig>,
    pub(crate) stats: StatsInfo,
}

/// A pod sandbox tracked by the daemon.
///
/// Locking:
/// - `op_lock` serializes lifecycle operations, reconciliation and the exit
///   callback, and is held across controller calls.
/// - `fields` guards the non-status fields and is never held across an await,
///   so status reads and accessors never wait on the backend.
/// - `state` has its own lock for status, pid and timestamps. When both are
///   taken, `fields` is taken first.
pub struct Sandbox {
    pub(crate) id: SandboxId,
    pub(crate) name: String,
    pub(crate) sandboxer: String,
    pub(crate) runtime_handler: String,
    pub(crate) rootdir: PathBuf,
    pub(crate) statedir: PathBuf,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) state: SandboxState,
    pub(crate) fields: RwLock<SandboxFields>,
    op_lock: Mutex<()>,
    pub(crate) persist_lock: Mutex<()>,
}

pub(crate) struct SandboxParts {
    pub(crate) id: SandboxId,
    pub(crate) name: String,
    pub(crate) sandboxer: String,
    pub(crate) runtime_handler: String,
    pub(crate) rootdir: PathBuf,
    pub(crate) statedir: PathBuf,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) state: StateSnapshot,
    pub(crate) fields: SandboxFields,
}

impl Sandbox {
    /// Construct a sandbox in memory.
    ///
    /// Nothing is written and no backend call is made; the controller is
    /// resolved and the exit callback registered.
    ///
    /// The controller keeps one callback per id, so constructing a second
    /// sandbox with the id of a live one redirects that sandbox's exit
    /// notifications. Callers must keep ids unique, as [`SandboxManager`]
    /// does.
    ///
    /// [`SandboxManager`]: crate::SandboxManager
    pub fn new(
        params: SandboxParams,
        root_base: &Path,
        state_base: &Path,
        controllers: &ControllerManager,
    ) -> Result<Arc<Self>> {
        params.config.validate()?;
        let id = params.id.unwrap_or_default();
        id.validate()?;

        let controller = controllers
            .get(&params.sandboxer)
            .ok_or_else(|| CoreError::UnknownSandboxer(params.sandboxer.clone()))?;

        let name = if params.name.is_empty() {
            params.config.name.clone()
        } else {
            params.name
        };

        tracing::debug!(
            sandbox_id = %id,
            name = %name,
            sandboxer = %params.sandboxer,
            "Constructing sandbox"
        );

        Ok(Self::assemble(SandboxParts {
            rootdir: root_base.join(id.as_str()),
            statedir: state_base.join(id.as_str()),
            id,
            name,
            sandboxer: params.sandboxer,
            runtime_handler: params.runtime_handler,
            controller,
            state: StateSnapshot::default(),
            fields: SandboxFields {
                netns_path: params.netns_path,
                config: Arc::new(params.config),
                ..Default::default()
            },
        }))
    }

    pub(crate) fn assemble(parts: SandboxParts) -> Arc<Self> {
        let sandbox = Arc::new(Self {
            id: parts.id,
            name: parts.name,
            sandboxer: parts.sandboxer,
            runtime_handler: parts.runtime_handler,
            rootdir: parts.rootdir,
            statedir: parts.statedir,
            controller: parts.controller,
            state: SandboxState::from_snapshot(parts.state),
            fields: RwLock::new(parts.fields),
            op_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
        });

        let weak = Arc::downgrade(&sandbox);
        let callback: Weak<dyn SandboxExitCallback> = weak;
        sandbox.controller.watch_exit(sandbox.id.as_str(), callback);
        sandbox
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sandboxer(&self) -> &str {
        &self.sandboxer
    }

    pub fn runtime_handler(&self) -> &str {
        &self.runtime_handler
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    pub fn statedir(&self) -> &Path {
        &self.statedir
    }

    /// Status, pid and timestamps.
    pub fn state(&self) -> &SandboxState {
        &self.state
    }

    /// True while the sandbox is running.
    pub fn is_ready(&self) -> bool {
        self.state.status() == SandboxStatus::Running
    }

    pub fn containers(&self) -> Vec<String> {
        self.fields.read().containers.clone()
    }

    pub fn sandbox_config(&self) -> Arc<SandboxConfig> {
        Arc::clone(&self.fields.read().config)
    }

    pub fn task_address(&self) -> String {
        self.fields.read().task_address.clone()
    }

    pub fn netns_path(&self) -> String {
        self.fields.read().netns_path.clone()
    }

    pub fn network_settings(&self) -> String {
        self.fields.read().network_settings.clone()
    }

    pub fn network_ready(&self) -> bool {
        self.fields.read().network_ready
    }

    pub fn stats_info(&self) -> StatsInfo {
        self.fields.read().stats
    }

    pub fn hostname_path(&self) -> PathBuf {
        self.rootdir.join("hostname")
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.rootdir.join("hosts")
    }

    pub fn resolv_path(&self) -> PathBuf {
        self.rootdir.join("resolv.conf")
    }

    pub fn shm_path(&self) -> PathBuf {
        self.rootdir.join("mounts").join("shm")
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Store a new stats sample and return the previous one.
    pub fn update_stats_info(&self, info: StatsInfo) -> StatsInfo {
        std::mem::replace(&mut self.fields.write().stats, info)
    }

    pub fn set_network_ready(&self, ready: bool) {
        self.fields.write().network_ready = ready;
    }

    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut fields = self.fields.write();
        Arc::make_mut(&mut fields.config)
            .annotations
            .insert(key.into(), value.into());
    }

    pub fn remove_annotation(&self, key: &str) {
        let mut fields = self.fields.write();
        if fields.config.annotations.contains_key(key) {
            Arc::make_mut(&mut fields.config).annotations.remove(key);
        }
    }

    pub fn add_label(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut fields = self.fields.write();
        Arc::make_mut(&mut fields.config)
            .labels
            .insert(key.into(), value.into());
    }

    pub fn remove_label(&self, key: &str) {
        let mut fields = self.fields.write();
        if fields.config.labels.contains_key(key) {
            Arc::make_mut(&mut fields.config).labels.remove(key);
        }
    }

    /// Attach a container. Already attached IDs are ignored.
    pub fn add_container(&self, container_id: &str) {
        let mut fields = self.fields.write();
        if fields.containers.iter().any(|c| c == container_id) {
            tracing::trace!(sandbox_id = %self.id, container_id, "Container already attached");
            return;
        }
        fields.containers.push(container_id.to_string());
    }

    /// Replace the container list, dropping repeated IDs.
    pub fn set_containers(&self, containers: &[String]) {
        let mut deduped: Vec<String> = Vec::with_capacity(containers.len());
        for id in containers {
            if !deduped.contains(id) {
                deduped.push(id.clone());
            }
        }
        self.fields.write().containers = deduped;
    }

    /// Detach a container. Unknown IDs are ignored.
    pub fn remove_container(&self, container_id: &str) {
        self.fields.write().containers.retain(|c| c != container_id);
    }

    /// Validate and store network settings, then persist them.
    ///
    /// A JSON `null` clears the settings and marks the network not ready;
    /// any other JSON document marks it ready. The in-memory update stands
    /// even if persisting fails.
    pub async fn update_network_settings(&self, settings_json: &str) -> Result<()> {
        if settings_json.trim().is_empty() {
            return Err(CoreError::InvalidNetworkSettings("empty document".into()));
        }
        let value: serde_json::Value = serde_json::from_str(settings_json)
            .map_err(|e| CoreError::InvalidNetworkSettings(e.to_string()))?;

        {
            let mut fields = self.fields.write();
            if value.is_null() {
                fields.network_settings.clear();
                fields.network_ready = false;
            } else {
                fields.network_settings = settings_json.to_string();
                fields.network_ready = true;
            }
        }
        tracing::debug!(sandbox_id = %self.id, ready = !value.is_null(), "Network settings updated");

        self.save_network_settings().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Lay out the sandbox directories, persist the initial documents and
    /// create the sandbox in the backend.
    ///
    /// On failure the sandbox stays `Unknown`; directories already created
    /// are left for the caller to clean up.
    pub async fn create(&self) -> Result<()> {
        self.is_removal_in_process()?;
        let _op = self.op_lock.lock().await;
        self.check_status(&[SandboxStatus::Unknown], "unknown")?;

        let start = Instant::now();
        tracing::info!(
            sandbox_id = %self.id,
            name = %self.name,
            sandboxer = %self.sandboxer,
            "Creating sandbox"
        );

        self.setup_sandbox_files().await?;
        self.save().await?;

        let params = self.create_params();
        if let Err(e) = self.controller.create(self.id.as_str(), &params).await {
            tracing::error!(sandbox_id = %self.id, error = %e, "Backend create failed");
            return Err(e.into());
        }

        {
            let _fields = self.fields.write();
            self.state.set_created_at(Utc::now());
            self.state.set_status(SandboxStatus::Created);
        }
        self.save_state().await?;

        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(())
    }

    /// Start a created sandbox.
    pub async fn start(&self) -> Result<()> {
        self.is_removal_in_process()?;
        let _op = self.op_lock.lock().await;
        self.check_status(&[SandboxStatus::Created], "created")?;

        let start = Instant::now();
        tracing::info!(sandbox_id = %self.id, "Starting sandbox");

        let info = match self.controller.start(self.id.as_str()).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, error = %e, "Backend start failed");
                return Err(e.into());
            }
        };

        {
            let mut fields = self.fields.write();
            fields.task_address = info.task_address;
            self.state.set_pid(info.pid);
            self.state.set_created_at(info.created_at);
            self.state.set_status(SandboxStatus::Running);
        }
        self.save_state().await?;

        tracing::info!(
            sandbox_id = %self.id,
            pid = info.pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox running"
        );
        Ok(())
    }

    /// Stop a running sandbox, giving it `timeout` (default 10s) to exit.
    ///
    /// Stopping a sandbox that is not running succeeds without a backend
    /// call, including one that is being or has been removed.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let _op = self.op_lock.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.do_stop(timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)).await
    }

    /// Remove the sandbox from the backend and delete its files.
    ///
    /// Without `force` the sandbox must be created or stopped. With `force`
    /// a running sandbox is stopped first. The status is `Removing` while
    /// the backend works and is rolled back if removal fails.
    pub async fn remove(&self, force: bool) -> Result<()> {
        self.is_removal_in_process()?;
        let _op = self.op_lock.lock().await;
        let status = self.state.status();
        match (status, force) {
            (SandboxStatus::Removing, _) => {
                return Err(CoreError::RemovalInProgress(self.id.clone()));
            }
            (SandboxStatus::Created | SandboxStatus::Stopped, _) => {}
            (SandboxStatus::Running, true) => {
                tracing::info!(sandbox_id = %self.id, "Force stopping sandbox before removal");
                self.do_stop(DEFAULT_STOP_TIMEOUT).await?;
            }
            (SandboxStatus::Unknown, true) => {}
            (actual, false) => {
                return Err(CoreError::InvalidState {
                    expected: "created or stopped".into(),
                    actual: actual.to_string(),
                });
            }
        }

        let start = Instant::now();
        let previous = self.state.update_status(SandboxStatus::Removing);
        tracing::info!(sandbox_id = %self.id, previous = %previous, force, "Removing sandbox");

        match self.controller.remove(self.id.as_str(), force).await {
            Ok(()) => {}
            Err(ControllerError::NotFound(_)) => {
                tracing::debug!(sandbox_id = %self.id, "Backend has no record, nothing to remove");
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, error = %e, "Backend remove failed");
                self.state.set_status(previous);
                return Err(e.into());
            }
        }

        if let Err(e) = self.delete_sandbox_files().await {
            tracing::error!(sandbox_id = %self.id, error = %e, "Failed to delete sandbox files");
            self.state.set_status(previous);
            return Err(e);
        }

        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox removed"
        );
        Ok(())
    }

    /// Build a view of the sandbox from cached state. Never calls the backend.
    pub fn status(&self) -> SandboxSnapshot {
        let fields = self.fields.read();
        let state = self.state.snapshot();
        // Exit fields only carry meaning once the sandbox has exited.
        let exited = state.status.has_exited();
        SandboxSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            sandboxer: self.sandboxer.clone(),
            runtime_handler: self.runtime_handler.clone(),
            pid: state.pid,
            status: state.status,
            ready: state.status == SandboxStatus::Running,
            created_at: state.created_at,
            exited_at: state.exited_at.filter(|_| exited),
            exit_status: if exited { state.exit_status } else { 0 },
            task_address: fields.task_address.clone(),
            netns_path: fields.netns_path.clone(),
            network_ready: fields.network_ready,
            containers: fields.containers.clone(),
            labels: fields.config.labels.clone(),
            annotations: fields.config.annotations.clone(),
        }
    }

    /// Ask the backend for the authoritative status and merge it in.
    ///
    /// Skipped without a backend call once removal has started.
    pub async fn update_status(&self) -> Result<()> {
        if self.removal_started() {
            return Ok(());
        }
        let _op = self.op_lock.lock().await;
        if self.removal_started() {
            return Ok(());
        }
        let status = self.controller.status(self.id.as_str(), false).await?;
        if !self.do_update_status(status) {
            return Ok(());
        }
        self.save_state().await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_status(&self, allowed: &[SandboxStatus], expected: &str) -> Result<()> {
        self.is_removal_in_process()?;
        let actual = self.state.status();
        if allowed.contains(&actual) {
            return Ok(());
        }
        Err(CoreError::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        })
    }

    fn is_running(&self) -> bool {
        let status = self.state.status();
        if status != SandboxStatus::Running {
            tracing::debug!(sandbox_id = %self.id, status = %status, "Sandbox not running, nothing to stop");
            return false;
        }
        true
    }

    fn removal_started(&self) -> bool {
        let removing = self.state.status() == SandboxStatus::Removing;
        if removing {
            tracing::debug!(sandbox_id = %self.id, "Removal in process, skipping reconciliation");
        }
        removing
    }

    fn is_removal_in_process(&self) -> Result<()> {
        if self.state.status() == SandboxStatus::Removing {
            return Err(CoreError::RemovalInProgress(self.id.clone()));
        }
        Ok(())
    }

    /// Caller holds `op_lock`.
    async fn do_stop(&self, timeout: Duration) -> Result<()> {
        self.is_removal_in_process()?;
        if !self.is_running() {
            return Ok(());
        }

        let start = Instant::now();
        tracing::info!(
            sandbox_id = %self.id,
            timeout_secs = timeout.as_secs(),
            "Stopping sandbox"
        );

        let exit = match self.controller.stop(self.id.as_str(), timeout).await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, error = %e, "Backend stop failed");
                return Err(e.into());
            }
        };

        {
            let _fields = self.fields.write();
            self.state.mark_exited(exit.exit_status, exit.exited_at);
        }
        self.save_state().await?;

        tracing::info!(
            sandbox_id = %self.id,
            exit_status = exit.exit_status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox stopped"
        );
        Ok(())
    }

    /// Merge a backend status report. Returns false when nothing was applied.
    fn do_update_status(&self, status: ControllerSandboxStatus) -> bool {
        let mut fields = self.fields.write();
        let previous = self.state.status();
        if previous == SandboxStatus::Removing {
            tracing::debug!(sandbox_id = %self.id, "Removal in process, skipping reconciliation");
            return false;
        }

        if status.pid != 0 {
            self.state.set_pid(status.pid);
        }
        if !status.task_address.is_empty() {
            fields.task_address = status.task_address;
        }
        if let Some(created_at) = status.created_at {
            self.state.set_created_at(created_at);
        }
        self.state.set_updated_at(Utc::now());

        match status.state {
            ControllerSandboxState::Ready => self.state.set_status(SandboxStatus::Running),
            ControllerSandboxState::NotReady => match status.exited_at {
                Some(exited_at) => self.state.mark_exited(status.exit_status, exited_at),
                // A created-but-never-started sandbox is also not ready.
                None if previous == SandboxStatus::Running => {
                    self.state.mark_exited(status.exit_status, Utc::now());
                }
                None => {}
            },
            ControllerSandboxState::Unknown => {}
        }
        drop(fields);

        tracing::debug!(
            sandbox_id = %self.id,
            previous = %previous,
            status = %self.state.status(),
            "Reconciled with backend"
        );
        true
    }

    fn create_params(&self) -> ControllerCreateParams {
        let fields = self.fields.read();
        ControllerCreateParams {
            config: Arc::clone(&fields.config),
            runtime_handler: self.runtime_handler.clone(),
            netns_path: fields.netns_path.clone(),
            rootdir: self.rootdir.clone(),
            statedir: self.statedir.clone(),
        }
    }

    /// Create the root and state directories and the files the sandbox's
    /// containers bind-mount.
    async fn setup_sandbox_files(&self) -> Result<()> {
        tracing::debug!(
            sandbox_id = %self.id,
            rootdir = %self.rootdir.display(),
            statedir = %self.statedir.display(),
            "Setting up sandbox files"
        );
        tokio::fs::create_dir_all(&self.rootdir).await?;
        tokio::fs::create_dir_all(&self.statedir).await?;
        tokio::fs::create_dir_all(self.shm_path()).await?;

        let config = self.sandbox_config();
        let hostname = config.hostname_or(&self.name);
        tokio::fs::write(self.hostname_path(), format!("{}\n", hostname)).await?;
        tokio::fs::write(
            self.hosts_path(),
            format!("{}127.0.1.1\t{}\n", HOSTS_TEMPLATE, hostname),
        )
        .await?;

        let resolv = config.dns.as_ref().map(|dns| dns.render()).unwrap_or_default();
        tokio::fs::write(self.resolv_path(), resolv).await?;
        Ok(())
    }

    async fn delete_sandbox_files(&self) -> Result<()> {
        let _persist = self.persist_lock.lock().await;
        for dir in [&self.statedir, &self.rootdir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::persist(dir, e)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxExitCallback for Sandbox {
    /// Apply an exit the backend noticed on its own.
    ///
    /// Only a running sandbox is moved to `Stopped`; anything else means an
    /// explicit stop or removal already won, and the notification is dropped.
    async fn on_sandbox_exit(&self, exit: ControllerExitInfo) {
        let _op = self.op_lock.lock().await;
        {
            let _fields = self.fields.write();
            let status = self.state.status();
            if status != SandboxStatus::Running {
                tracing::debug!(
                    sandbox_id = %self.id,
                    status = %status,
                    "Ignoring stale exit notification"
                );
                return;
            }
            self.state.mark_exited(exit.exit_status, exit.exited_at);
        }

        tracing::info!(
            sandbox_id = %self.id,
            exit_status = exit.exit_status,
            "Sandbox exited"
        );
        if let Err(e) = self.save_state().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to persist exit state");
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sandboxer", &self.sandboxer)
            .field("status", &self.state.status())
            .finish()
    }
}
