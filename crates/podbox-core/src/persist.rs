//! On-disk mirror of a sandbox.
//!
//! Three independent JSON documents live in the sandbox's state directory:
//! identity and creation config, runtime state, and network settings. Each
//! is written atomically (temp file + rename) and a failure on one leaves
//! the others untouched.

use crate::config::SandboxConfig;
use crate::controller::ControllerManager;
use crate::error::{CoreError, Result};
use crate::sandbox::{Sandbox, SandboxFields, SandboxId, SandboxParts};
use crate::state::{SandboxStatus, StateSnapshot};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const SANDBOX_METADATA_JSON: &str = "sandbox_metadata.json";
pub const SANDBOX_STATE_JSON: &str = "sandbox_state.json";
pub const NETWORK_SETTINGS_JSON: &str = "network_settings.json";

/// Identity and creation config. Written at create, rewritten by `save`.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataDocument {
    id: SandboxId,
    name: String,
    sandboxer: String,
    #[serde(default)]
    runtime_handler: String,
    #[serde(default)]
    netns_path: String,
    config: SandboxConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    status: SandboxStatus,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    exit_status: u32,
    #[serde(default)]
    task_address: String,
    #[serde(default)]
    containers: Vec<String>,
}

impl StateDocument {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            pid: self.pid,
            created_at: self.created_at,
            updated_at: self.updated_at,
            exited_at: self.exited_at,
            exit_status: self.exit_status,
            status: self.status,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkDocument {
    #[serde(default)]
    network_ready: bool,
    #[serde(default)]
    network_settings: String,
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, &data)
        .await
        .map_err(|e| CoreError::persist(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(CoreError::persist(path, e));
    }
    tracing::trace!(path = %path.display(), bytes = data.len(), "Document written");
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| CoreError::persist(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

fn is_missing(err: &CoreError) -> bool {
    matches!(err, CoreError::Persist { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
}

impl Sandbox {
    pub fn metadata_json_path(&self) -> PathBuf {
        self.statedir.join(SANDBOX_METADATA_JSON)
    }

    pub fn state_json_path(&self) -> PathBuf {
        self.statedir.join(SANDBOX_STATE_JSON)
    }

    pub fn network_settings_json_path(&self) -> PathBuf {
        self.statedir.join(NETWORK_SETTINGS_JSON)
    }

    /// Write all three documents.
    ///
    /// Every document is attempted; the first failure is returned. On error
    /// the directory may be inconsistent and the save should be retried.
    pub async fn save(&self) -> Result<()> {
        let metadata = self.save_metadata().await;
        let state = self.save_state().await;
        let network = self.save_network_settings().await;
        metadata.and(state).and(network)
    }

    pub async fn save_metadata(&self) -> Result<()> {
        let _persist = self.persist_lock.lock().await;
        let doc = {
            let fields = self.fields.read();
            MetadataDocument {
                id: self.id.clone(),
                name: self.name.clone(),
                sandboxer: self.sandboxer.clone(),
                runtime_handler: self.runtime_handler.clone(),
                netns_path: fields.netns_path.clone(),
                config: SandboxConfig::clone(&fields.config),
            }
        };
        write_json_atomic(&self.metadata_json_path(), &doc).await
    }

    pub async fn save_state(&self) -> Result<()> {
        let _persist = self.persist_lock.lock().await;
        let doc = {
            let fields = self.fields.read();
            let state = self.state.snapshot();
            StateDocument {
                pid: state.pid,
                status: state.status,
                created_at: state.created_at,
                updated_at: state.updated_at,
                exited_at: state.exited_at,
                exit_status: state.exit_status,
                task_address: fields.task_address.clone(),
                containers: fields.containers.clone(),
            }
        };
        write_json_atomic(&self.state_json_path(), &doc).await
    }

    pub async fn save_network_settings(&self) -> Result<()> {
        let _persist = self.persist_lock.lock().await;
        let doc = {
            let fields = self.fields.read();
            NetworkDocument {
                network_ready: fields.network_ready,
                network_settings: fields.network_settings.clone(),
            }
        };
        write_json_atomic(&self.network_settings_json_path(), &doc).await
    }

    /// Rebuild a sandbox from its persisted documents.
    ///
    /// Used at daemon startup. The backend is not contacted beyond
    /// registering the exit callback; reconcile afterwards with
    /// [`Sandbox::update_status`]. A missing network document means the
    /// network was never configured. An interrupted removal comes back as
    /// `Stopped` so it can be retried.
    ///
    /// Registering the callback replaces any callback held for the same id,
    /// so a sandbox must not be loaded while a live object with its id
    /// exists. [`SandboxManager::restore`](crate::SandboxManager::restore)
    /// skips ids it already tracks.
    pub async fn load(
        id: &SandboxId,
        root_base: &Path,
        state_base: &Path,
        controllers: &ControllerManager,
    ) -> Result<Arc<Self>> {
        id.validate()?;
        let statedir = state_base.join(id.as_str());

        let metadata: MetadataDocument = read_json(&statedir.join(SANDBOX_METADATA_JSON)).await?;
        if &metadata.id != id {
            return Err(CoreError::InvalidConfig(format!(
                "metadata in {} belongs to sandbox {}",
                statedir.display(),
                metadata.id
            )));
        }
        let controller = controllers
            .get(&metadata.sandboxer)
            .ok_or_else(|| CoreError::UnknownSandboxer(metadata.sandboxer.clone()))?;

        let state: StateDocument = read_json(&statedir.join(SANDBOX_STATE_JSON)).await?;
        let network: NetworkDocument =
            match read_json(&statedir.join(NETWORK_SETTINGS_JSON)).await {
                Ok(doc) => doc,
                Err(e) if is_missing(&e) => {
                    tracing::debug!(sandbox_id = %id, "No network settings persisted");
                    NetworkDocument::default()
                }
                Err(e) => return Err(e),
            };

        let mut snapshot = state.snapshot();
        if snapshot.status == SandboxStatus::Removing {
            tracing::warn!(sandbox_id = %id, "Found interrupted removal, restoring as stopped");
            snapshot.status = SandboxStatus::Stopped;
        }

        tracing::debug!(
            sandbox_id = %id,
            status = %snapshot.status,
            pid = snapshot.pid,
            containers = state.containers.len(),
            "Loaded sandbox"
        );

        Ok(Self::assemble(SandboxParts {
            rootdir: root_base.join(id.as_str()),
            statedir,
            id: metadata.id,
            name: metadata.name,
            sandboxer: metadata.sandboxer,
            runtime_handler: metadata.runtime_handler,
            controller,
            state: snapshot,
            fields: SandboxFields {
                task_address: state.task_address,
                netns_path: metadata.netns_path,
                network_ready: network.network_ready,
                network_settings: network.network_settings,
                containers: state.containers,
                config: Arc::new(metadata.config),
                stats: Default::default(),
            },
        }))
    }
}

/// IDs of the sandboxes persisted under `state_base`, sorted.
///
/// A directory counts when it holds a metadata document.
pub async fn list_persisted(state_base: &Path) -> Result<Vec<SandboxId>> {
    let mut entries = match tokio::fs::read_dir(state_base).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::persist(state_base, e)),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let has_metadata = tokio::fs::metadata(entry.path().join(SANDBOX_METADATA_JSON))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !has_metadata {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            ids.push(SandboxId::from_string(name));
        }
    }
    ids.sort();
    Ok(ids)
}
