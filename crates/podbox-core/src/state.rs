//! Runtime status of a sandbox.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Constructed or loaded, backend sandbox not created yet.
    #[default]
    Unknown,
    /// Backend sandbox exists but is not running.
    Created,
    /// Backend sandbox is running.
    Running,
    /// Backend sandbox exited or was stopped.
    Stopped,
    /// Removal started; terminal.
    Removing,
}

impl SandboxStatus {
    /// True once exit fields carry meaning.
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Stopped | Self::Removing)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removing => write!(f, "removing"),
        }
    }
}

/// Last observed CPU usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsInfo {
    /// When the sample was taken.
    pub timestamp: Option<DateTime<Utc>>,
    /// Cumulative CPU time in nanoseconds at `timestamp`.
    pub cpu_use_nanos: u64,
}

/// Point-in-time copy of every [`SandboxState`] field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub pid: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_status: u32,
    pub status: SandboxStatus,
}

/// Status, pid and timestamps of a sandbox behind their own lock.
///
/// Every getter and setter is atomic on its own. Callers that need several
/// fields to agree use [`SandboxState::snapshot`] or hold the sandbox's
/// operation lock across the calls.
#[derive(Debug, Default)]
pub struct SandboxState {
    inner: RwLock<StateSnapshot>,
}

impl SandboxState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.read().pid
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().created_at
    }

    /// Kept for on-disk compatibility; nothing reads it for decisions.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().updated_at
    }

    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().exited_at
    }

    pub fn exit_status(&self) -> u32 {
        self.inner.read().exit_status
    }

    pub fn status(&self) -> SandboxStatus {
        self.inner.read().status
    }

    pub fn snapshot(&self) -> StateSnapshot {
        *self.inner.read()
    }

    pub fn set_pid(&self, pid: u32) {
        self.inner.write().pid = pid;
    }

    pub fn set_created_at(&self, time: DateTime<Utc>) {
        self.inner.write().created_at = Some(time);
    }

    pub fn set_updated_at(&self, time: DateTime<Utc>) {
        self.inner.write().updated_at = Some(time);
    }

    pub fn set_exited_at(&self, time: DateTime<Utc>) {
        self.inner.write().exited_at = Some(time);
    }

    pub fn set_exit_status(&self, code: u32) {
        self.inner.write().exit_status = code;
    }

    pub fn set_status(&self, status: SandboxStatus) {
        self.inner.write().status = status;
    }

    /// Set the status and return the one it replaced.
    ///
    /// The transition graph is not checked here.
    pub fn update_status(&self, status: SandboxStatus) -> SandboxStatus {
        std::mem::replace(&mut self.inner.write().status, status)
    }

    /// Record an exit and move to `Stopped` in one write.
    pub(crate) fn mark_exited(&self, exit_status: u32, exited_at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        inner.exit_status = exit_status;
        inner.exited_at = Some(exited_at);
        inner.status = SandboxStatus::Stopped;
    }
}
