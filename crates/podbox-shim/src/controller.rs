//! ShimController - runs one pause process per sandbox.

use crate::config::ShimConfig;
use crate::error::{Result, ShimError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use podbox_core::{
    Controller, ControllerCreateParams, ControllerError, ControllerExitInfo,
    ControllerSandboxInfo, ControllerSandboxState, ControllerSandboxStatus, SandboxExitCallback,
};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

type ExitReceiver = watch::Receiver<Option<ControllerExitInfo>>;
type Callbacks = Arc<Mutex<HashMap<String, Weak<dyn SandboxExitCallback>>>>;

/// Pause process bookkeeping for one sandbox.
#[derive(Debug)]
struct ShimTask {
    bundle: PathBuf,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    exit_rx: Option<ExitReceiver>,
}

impl ShimTask {
    fn exit(&self) -> Option<ControllerExitInfo> {
        self.exit_rx.as_ref().and_then(|rx| *rx.borrow())
    }

    fn is_running(&self) -> bool {
        self.pid.is_some() && self.exit().is_none()
    }
}

/// Sandbox backend that stands a sandbox up as a long-lived host process.
///
/// The process is spawned on `start` and a waiter task reaps it. When it
/// exits, the exit is published on a watch channel (which `stop` waits on)
/// and then handed to the sandbox's registered exit callback.
pub struct ShimController {
    config: ShimConfig,
    tasks: Mutex<HashMap<String, ShimTask>>,
    callbacks: Callbacks,
}

impl ShimController {
    /// Create a new controller.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ShimConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            bundle_root = %config.bundle_root.display(),
            pause_command = ?config.pause_command,
            "Creating shim controller"
        );
        Ok(Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    /// Number of sandboxes this controller knows about.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn bundle_path(&self, sandbox_id: &str) -> PathBuf {
        self.config.bundle_root.join(sandbox_id)
    }

    fn spawn_pause(&self, sandbox_id: &str, bundle: &PathBuf) -> Result<tokio::process::Child> {
        let (program, args) = self
            .config
            .pause_command
            .split_first()
            .ok_or_else(|| ShimError::Config("pause_command cannot be empty".into()))?;

        Command::new(program)
            .args(args)
            .current_dir(bundle)
            .env("PODBOX_SANDBOX_ID", sandbox_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ShimError::Spawn {
                command: self.config.pause_command.join(" "),
                source,
            })
    }

    /// Reap the pause process, publish its exit, then notify the sandbox.
    fn spawn_waiter(
        &self,
        sandbox_id: String,
        mut child: tokio::process::Child,
        exit_tx: watch::Sender<Option<ControllerExitInfo>>,
    ) {
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            let exit_status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to reap pause process");
                    255
                }
            };
            let exit = ControllerExitInfo {
                exit_status,
                exited_at: Utc::now(),
            };
            exit_tx.send_replace(Some(exit));
            tracing::debug!(sandbox_id = %sandbox_id, exit_status, "Pause process exited");

            let callback = callbacks.lock().get(&sandbox_id).and_then(Weak::upgrade);
            match callback {
                Some(callback) => callback.on_sandbox_exit(exit).await,
                None => {
                    tracing::debug!(sandbox_id = %sandbox_id, "No live exit callback registered");
                }
            }
        });
    }

    /// Look up what `stop`/`remove` need without holding the lock across awaits.
    fn running_handle(&self, sandbox_id: &str) -> std::result::Result<Option<(u32, ExitReceiver)>, ControllerError> {
        let tasks = self.tasks.lock();
        let task = tasks
            .get(sandbox_id)
            .ok_or_else(|| ControllerError::NotFound(sandbox_id.to_string()))?;
        match (task.pid, &task.exit_rx) {
            (Some(pid), Some(rx)) => Ok(Some((pid, rx.clone()))),
            _ => Ok(None),
        }
    }

    /// Signal the process and wait up to `timeout` for it to exit.
    async fn signal_and_wait(
        &self,
        pid: u32,
        signal: Signal,
        rx: &mut ExitReceiver,
        timeout: Duration,
    ) -> Result<Option<ControllerExitInfo>> {
        let published = *rx.borrow();
        if let Some(exit) = published {
            return Ok(Some(exit));
        }
        send_signal(pid, signal)?;
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => Ok(*exit),
            // The waiter task is gone without publishing; treat as exited now.
            Ok(Err(_)) => Ok(Some(ControllerExitInfo {
                exit_status: 255,
                exited_at: Utc::now(),
            })),
            Err(_) => Ok(None),
        }
    }

    /// SIGTERM, wait `timeout`, then SIGKILL and wait the kill grace.
    async fn terminate(
        &self,
        sandbox_id: &str,
        pid: u32,
        mut rx: ExitReceiver,
        timeout: Duration,
    ) -> Result<ControllerExitInfo> {
        if !timeout.is_zero() {
            if let Some(exit) = self
                .signal_and_wait(pid, Signal::SIGTERM, &mut rx, timeout)
                .await?
            {
                return Ok(exit);
            }
            tracing::warn!(
                sandbox_id = %sandbox_id,
                pid,
                timeout_secs = timeout.as_secs(),
                "Pause process ignored SIGTERM, killing"
            );
        }

        self.signal_and_wait(pid, Signal::SIGKILL, &mut rx, self.config.kill_grace)
            .await?
            .ok_or(ShimError::Unkillable(pid))
    }
}

fn exit_code(status: ExitStatus) -> u32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => 255,
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| ShimError::Config(format!("pid {} out of range", pid)))?;
    match kill(Pid::from_raw(raw), signal) {
        // Already gone; the waiter publishes the exit.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ShimError::Signal { pid, signal, source }),
    }
}

#[async_trait]
impl Controller for ShimController {
    async fn create(
        &self,
        sandbox_id: &str,
        params: &ControllerCreateParams,
    ) -> std::result::Result<(), ControllerError> {
        let exists = self.tasks.lock().contains_key(sandbox_id);
        if exists {
            return Err(ControllerError::InvalidState(format!(
                "sandbox {} already exists",
                sandbox_id
            )));
        }

        let bundle = self.bundle_path(sandbox_id);
        tokio::fs::create_dir_all(&bundle).await?;
        let config = serde_json::to_vec_pretty(&*params.config).map_err(ShimError::from)?;
        tokio::fs::write(bundle.join("config.json"), config).await?;

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(sandbox_id) {
            return Err(ControllerError::InvalidState(format!(
                "sandbox {} already exists",
                sandbox_id
            )));
        }
        tasks.insert(
            sandbox_id.to_string(),
            ShimTask {
                bundle: bundle.clone(),
                pid: None,
                started_at: None,
                exit_rx: None,
            },
        );
        tracing::debug!(sandbox_id, bundle = %bundle.display(), "Shim sandbox created");
        Ok(())
    }

    async fn start(&self, sandbox_id: &str) -> std::result::Result<ControllerSandboxInfo, ControllerError> {
        let bundle = {
            let tasks = self.tasks.lock();
            let task = tasks
                .get(sandbox_id)
                .ok_or_else(|| ControllerError::NotFound(sandbox_id.to_string()))?;
            if task.pid.is_some() {
                return Err(ControllerError::InvalidState(format!(
                    "sandbox {} already started",
                    sandbox_id
                )));
            }
            task.bundle.clone()
        };

        let child = self.spawn_pause(sandbox_id, &bundle)?;
        let pid = child
            .id()
            .ok_or_else(|| ControllerError::Backend("pause process exited before start".into()))?;
        let started_at = Utc::now();
        let (exit_tx, exit_rx) = watch::channel(None);

        {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(sandbox_id) {
                Some(task) => {
                    task.pid = Some(pid);
                    task.started_at = Some(started_at);
                    task.exit_rx = Some(exit_rx);
                }
                None => {
                    // Removed while spawning; the waiter reaps the orphan.
                    drop(tasks);
                    let _ = send_signal(pid, Signal::SIGKILL);
                    self.spawn_waiter(sandbox_id.to_string(), child, exit_tx);
                    return Err(ControllerError::NotFound(sandbox_id.to_string()));
                }
            }
        }
        self.spawn_waiter(sandbox_id.to_string(), child, exit_tx);

        tracing::info!(sandbox_id, pid, "Pause process started");
        Ok(ControllerSandboxInfo {
            pid,
            created_at: started_at,
            task_address: format!("/proc/{}", pid),
        })
    }

    async fn stop(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> std::result::Result<ControllerExitInfo, ControllerError> {
        let (pid, rx) = self.running_handle(sandbox_id)?.ok_or_else(|| {
            ControllerError::InvalidState(format!("sandbox {} was never started", sandbox_id))
        })?;

        let exit = self.terminate(sandbox_id, pid, rx, timeout).await?;
        tracing::info!(sandbox_id, pid, exit_status = exit.exit_status, "Pause process stopped");
        Ok(exit)
    }

    async fn remove(&self, sandbox_id: &str, force: bool) -> std::result::Result<(), ControllerError> {
        if let Some((pid, rx)) = self.running_handle(sandbox_id)? {
            let exited = rx.borrow().is_some();
            if !exited {
                if !force {
                    return Err(ControllerError::InvalidState(format!(
                        "sandbox {} is running",
                        sandbox_id
                    )));
                }
                self.terminate(sandbox_id, pid, rx, Duration::ZERO).await?;
            }
        }

        let task = self.tasks.lock().remove(sandbox_id);
        self.callbacks.lock().remove(sandbox_id);
        if let Some(task) = task {
            match tokio::fs::remove_dir_all(&task.bundle).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(sandbox_id, "Shim sandbox removed");
        Ok(())
    }

    async fn status(
        &self,
        sandbox_id: &str,
        verbose: bool,
    ) -> std::result::Result<ControllerSandboxStatus, ControllerError> {
        let tasks = self.tasks.lock();
        let task = tasks
            .get(sandbox_id)
            .ok_or_else(|| ControllerError::NotFound(sandbox_id.to_string()))?;

        let exit = task.exit();
        let state = if task.is_running() {
            ControllerSandboxState::Ready
        } else {
            ControllerSandboxState::NotReady
        };

        let mut info = BTreeMap::new();
        if verbose {
            info.insert("bundle".to_string(), task.bundle.display().to_string());
            info.insert("pause_command".to_string(), self.config.pause_command.join(" "));
        }

        Ok(ControllerSandboxStatus {
            id: sandbox_id.to_string(),
            pid: task.pid.unwrap_or(0),
            state,
            task_address: task.pid.map(|pid| format!("/proc/{}", pid)).unwrap_or_default(),
            created_at: task.started_at,
            exited_at: exit.map(|e| e.exited_at),
            exit_status: exit.map(|e| e.exit_status).unwrap_or(0),
            info,
        })
    }

    fn watch_exit(&self, sandbox_id: &str, callback: Weak<dyn SandboxExitCallback>) {
        self.callbacks.lock().insert(sandbox_id.to_string(), callback);
    }
}

impl std::fmt::Debug for ShimController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimController")
            .field("config", &self.config)
            .field("tasks", &self.task_count())
            .finish()
    }
}
