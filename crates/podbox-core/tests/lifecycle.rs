//! Lifecycle tests for podbox-core against a scripted controller.
//!
//! The `FakeController` records every backend call so the tests can assert
//! how many times the backend was actually reached.

use async_trait::async_trait;
use chrono::Utc;
use podbox_core::{
    Controller, ControllerCreateParams, ControllerError, ControllerExitInfo, ControllerManager,
    ControllerSandboxInfo, ControllerSandboxState, ControllerSandboxStatus, CoreError,
    ManagerConfig, Sandbox, SandboxConfig, SandboxExitCallback, SandboxManager, SandboxParams,
    SandboxStatus, NETWORK_SETTINGS_JSON, SANDBOX_METADATA_JSON, SANDBOX_STATE_JSON,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tempfile::TempDir;

const FAKE_PID: u32 = 4242;

// ============================================================================
// Fake backend
// ============================================================================

#[derive(Default)]
struct FakeController {
    creates: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_remove: AtomicBool,
    remove_not_found: AtomicBool,
    stop_delay: Mutex<Duration>,
    remove_delay: Mutex<Duration>,
    status_reply: Mutex<Option<ControllerSandboxStatus>>,
    callbacks: Mutex<HashMap<String, Weak<dyn SandboxExitCallback>>>,
}

impl FakeController {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    fn set_remove_delay(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap() = delay;
    }

    fn set_status_reply(&self, reply: ControllerSandboxStatus) {
        *self.status_reply.lock().unwrap() = Some(reply);
    }

    /// Deliver an exit notification the way a backend watcher task would.
    async fn trigger_exit(&self, sandbox_id: &str, exit_status: u32) {
        let callback = self
            .callbacks
            .lock()
            .unwrap()
            .get(sandbox_id)
            .and_then(Weak::upgrade);
        if let Some(callback) = callback {
            callback
                .on_sandbox_exit(ControllerExitInfo {
                    exit_status,
                    exited_at: Utc::now(),
                })
                .await;
        }
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn create(
        &self,
        sandbox_id: &str,
        _params: &ControllerCreateParams,
    ) -> Result<(), ControllerError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ControllerError::Backend(format!("cannot create {}", sandbox_id)));
        }
        Ok(())
    }

    async fn start(&self, sandbox_id: &str) -> Result<ControllerSandboxInfo, ControllerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ControllerError::Backend(format!("cannot start {}", sandbox_id)));
        }
        Ok(ControllerSandboxInfo {
            pid: FAKE_PID,
            created_at: Utc::now(),
            task_address: format!("unix:///run/fake/{}.sock", sandbox_id),
        })
    }

    async fn stop(
        &self,
        _sandbox_id: &str,
        _timeout: Duration,
    ) -> Result<ControllerExitInfo, ControllerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ControllerError::Backend("task did not exit".into()));
        }
        Ok(ControllerExitInfo {
            exit_status: 0,
            exited_at: Utc::now(),
        })
    }

    async fn remove(&self, sandbox_id: &str, _force: bool) -> Result<(), ControllerError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.remove_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ControllerError::Backend("device busy".into()));
        }
        if self.remove_not_found.load(Ordering::SeqCst) {
            return Err(ControllerError::NotFound(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn status(
        &self,
        sandbox_id: &str,
        _verbose: bool,
    ) -> Result<ControllerSandboxStatus, ControllerError> {
        self.status_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ControllerError::NotFound(sandbox_id.to_string()))
    }

    fn watch_exit(&self, sandbox_id: &str, callback: Weak<dyn SandboxExitCallback>) {
        self.callbacks
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), callback);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn controllers(fake: &Arc<FakeController>) -> Arc<ControllerManager> {
    Arc::new(ControllerManager::new().with_controller("fake", fake.clone()))
}

fn manager_config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig::new(dir.path().join("root"), dir.path().join("state"))
}

fn manager(dir: &TempDir, fake: &Arc<FakeController>) -> SandboxManager {
    SandboxManager::new(manager_config(dir), controllers(fake))
}

fn params(name: &str) -> SandboxParams {
    SandboxParams {
        sandboxer: "fake".into(),
        netns_path: format!("/var/run/netns/{}", name),
        config: SandboxConfig::builder()
            .name(name)
            .namespace("default")
            .hostname(format!("{}-host", name))
            .label("app", name)
            .build()
            .unwrap(),
        ..Default::default()
    }
}

async fn running_sandbox(manager: &SandboxManager, name: &str) -> Arc<Sandbox> {
    let sandbox = manager.create(params(name)).await.unwrap();
    sandbox.start().await.unwrap();
    sandbox
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let sandbox = manager.create(params("web")).await.unwrap();
    assert_eq!(sandbox.state().status(), SandboxStatus::Created);
    assert!(sandbox.state().created_at().is_some());
    assert!(sandbox.statedir().join(SANDBOX_METADATA_JSON).is_file());
    assert!(sandbox.statedir().join(SANDBOX_STATE_JSON).is_file());
    assert!(sandbox.statedir().join(NETWORK_SETTINGS_JSON).is_file());

    sandbox.start().await.unwrap();
    let status = sandbox.status();
    assert_eq!(status.status, SandboxStatus::Running);
    assert!(status.ready);
    assert!(status.pid > 0);
    assert!(!status.task_address.is_empty());
    assert_eq!(status.labels.get("app").map(String::as_str), Some("web"));

    sandbox.stop(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
    assert!(sandbox.state().exited_at().is_some());
    assert!(!sandbox.is_ready());

    let statedir = sandbox.statedir().to_path_buf();
    let rootdir = sandbox.rootdir().to_path_buf();
    manager.remove(sandbox.id(), false).await.unwrap();
    assert!(!statedir.exists());
    assert!(!rootdir.exists());
    assert_eq!(manager.count().await, 0);

    assert_eq!(fake.creates.load(Ordering::SeqCst), 1);
    assert_eq!(fake.starts.load(Ordering::SeqCst), 1);
    assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fake.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_lays_out_sandbox_files() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let sandbox = manager.create(params("files")).await.unwrap();

    let hostname = std::fs::read_to_string(sandbox.hostname_path()).unwrap();
    assert_eq!(hostname, "files-host\n");
    let hosts = std::fs::read_to_string(sandbox.hosts_path()).unwrap();
    assert!(hosts.contains("127.0.0.1\tlocalhost"));
    assert!(hosts.contains("files-host"));
    assert_eq!(std::fs::read_to_string(sandbox.resolv_path()).unwrap(), "");
    assert!(sandbox.shm_path().is_dir());
}

#[tokio::test]
async fn test_stop_on_created_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let sandbox = manager.create(params("idle")).await.unwrap();
    sandbox.stop(None).await.unwrap();

    assert_eq!(sandbox.state().status(), SandboxStatus::Created);
    assert_eq!(fake.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_requires_created() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let sandbox = running_sandbox(&manager, "twice").await;
    let err = sandbox.start().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(fake.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remove_running_requires_force() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let sandbox = running_sandbox(&manager, "busy").await;
    let err = manager.remove(sandbox.id(), false).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(sandbox.state().status(), SandboxStatus::Running);
    assert!(manager.exists(sandbox.id()).await);

    manager.remove(sandbox.id(), true).await.unwrap();
    assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fake.removes.load(Ordering::SeqCst), 1);
    assert!(!manager.exists(sandbox.id()).await);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops_reach_backend_once() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    fake.set_stop_delay(Duration::from_millis(100));
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "racy").await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.stop(Some(Duration::from_secs(5))).await })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_while_removing_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    fake.set_remove_delay(Duration::from_millis(300));
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("slow")).await.unwrap();

    let first = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.remove(false).await })
    };

    while sandbox.state().status() != SandboxStatus::Removing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = std::time::Instant::now();
    let err = sandbox.remove(false).await.unwrap_err();
    assert!(matches!(err, CoreError::RemovalInProgress(_)));
    assert!(started.elapsed() < Duration::from_millis(200));

    first.await.unwrap().unwrap();
    assert_eq!(fake.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_and_reconcile_during_removal_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    fake.set_remove_delay(Duration::from_millis(300));
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "leaving").await;
    sandbox.stop(None).await.unwrap();

    let removal = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.remove(false).await })
    };
    while sandbox.state().status() != SandboxStatus::Removing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Neither call waits for the removal or reaches the backend.
    let started = std::time::Instant::now();
    sandbox.stop(None).await.unwrap();
    sandbox.update_status().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    removal.await.unwrap().unwrap();

    // Retrying after the removal finished still succeeds. The fake has no
    // status to report, so a backend status call would fail here.
    sandbox.stop(None).await.unwrap();
    sandbox.update_status().await.unwrap();
    assert_eq!(sandbox.state().status(), SandboxStatus::Removing);
    assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_and_remove_race() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("contested")).await.unwrap();

    let start = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.start().await })
    };
    let remove = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.remove(false).await })
    };
    let start = start.await.unwrap();
    let remove = remove.await.unwrap();

    assert!(start.is_ok() ^ remove.is_ok(), "exactly one must win");
    let loser = start.err().or(remove.err()).unwrap();
    assert!(matches!(
        loser,
        CoreError::InvalidState { .. } | CoreError::RemovalInProgress(_)
    ));

    let status = sandbox.state().status();
    assert!(matches!(
        status,
        SandboxStatus::Running | SandboxStatus::Removing
    ));
}

// ============================================================================
// Backend and persistence failures
// ============================================================================

#[tokio::test]
async fn test_start_failure_keeps_created() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("nostart")).await.unwrap();

    fake.fail_start.store(true, Ordering::SeqCst);
    let err = sandbox.start().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Controller(ControllerError::Backend(_))
    ));
    assert_eq!(sandbox.state().status(), SandboxStatus::Created);
    assert_eq!(sandbox.state().pid(), 0);
    assert!(sandbox.task_address().is_empty());

    // Not retried on its own; the next explicit start goes through.
    fake.fail_start.store(false, Ordering::SeqCst);
    sandbox.start().await.unwrap();
    assert_eq!(fake.starts.load(Ordering::SeqCst), 2);
    assert_eq!(sandbox.state().status(), SandboxStatus::Running);
}

#[tokio::test]
async fn test_stop_failure_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "stubborn").await;

    fake.fail_stop.store(true, Ordering::SeqCst);
    let err = sandbox.stop(None).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Controller(ControllerError::Backend(_))
    ));
    assert_eq!(sandbox.state().status(), SandboxStatus::Running);
    assert!(sandbox.state().exited_at().is_none());

    let persisted: serde_json::Value = serde_json::from_slice(
        &std::fs::read(sandbox.state_json_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted["status"], "running");
}

#[tokio::test]
async fn test_persist_failure_keeps_transition() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "diskfull").await;

    // A plain file where the state directory was makes every write fail.
    std::fs::remove_dir_all(sandbox.statedir()).unwrap();
    std::fs::write(sandbox.statedir(), b"").unwrap();

    let err = sandbox.stop(None).await.unwrap_err();
    assert!(matches!(err, CoreError::Persist { .. }));
    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
    assert!(sandbox.state().exited_at().is_some());
    assert_eq!(fake.stops.load(Ordering::SeqCst), 1);

    // Once the directory is back the next save catches up.
    std::fs::remove_file(sandbox.statedir()).unwrap();
    std::fs::create_dir_all(sandbox.statedir()).unwrap();
    sandbox.save().await.unwrap();
    let persisted: serde_json::Value = serde_json::from_slice(
        &std::fs::read(sandbox.state_json_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted["status"], "stopped");
}

// ============================================================================
// Exit notifications
// ============================================================================

#[tokio::test]
async fn test_exit_while_running_stops_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "crashy").await;

    fake.trigger_exit(sandbox.id().as_str(), 137).await;

    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
    assert_eq!(sandbox.state().exit_status(), 137);
    assert!(sandbox.state().exited_at().is_some());
    let view = sandbox.status();
    assert_eq!(view.exit_status, 137);
    assert!(view.exited_at.is_some());

    let persisted: serde_json::Value = serde_json::from_slice(
        &std::fs::read(sandbox.state_json_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted["status"], "stopped");
    assert_eq!(persisted["exit_status"], 137);

    // A stopped sandbox needs no backend stop.
    sandbox.stop(None).await.unwrap();
    assert_eq!(fake.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exit_after_stop_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "late").await;

    sandbox.stop(None).await.unwrap();
    let before = sandbox.state().snapshot();

    fake.trigger_exit(sandbox.id().as_str(), 9).await;

    let after = sandbox.state().snapshot();
    assert_eq!(before, after);
    assert_eq!(after.exit_status, 0);
}

// ============================================================================
// Removal failures
// ============================================================================

#[tokio::test]
async fn test_remove_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "sticky").await;
    sandbox.stop(None).await.unwrap();

    fake.fail_remove.store(true, Ordering::SeqCst);
    let err = manager.remove(sandbox.id(), false).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Controller(ControllerError::Backend(_))
    ));
    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
    assert!(sandbox.state_json_path().is_file());
    assert!(manager.exists(sandbox.id()).await);

    fake.fail_remove.store(false, Ordering::SeqCst);
    manager.remove(sandbox.id(), false).await.unwrap();
    assert!(!sandbox.statedir().exists());
    assert_eq!(fake.removes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remove_tolerates_backend_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    fake.remove_not_found.store(true, Ordering::SeqCst);
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("gone")).await.unwrap();

    manager.remove(sandbox.id(), false).await.unwrap();
    assert!(!sandbox.statedir().exists());
}

// ============================================================================
// Containers and network
// ============================================================================

#[tokio::test]
async fn test_container_membership() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("pod")).await.unwrap();

    sandbox.add_container("c1");
    sandbox.add_container("c1");
    assert_eq!(sandbox.containers(), vec!["c1".to_string()]);

    sandbox.remove_container("absent");
    assert_eq!(sandbox.containers(), vec!["c1".to_string()]);

    sandbox.set_containers(&["c2".into(), "c3".into(), "c2".into()]);
    assert_eq!(sandbox.containers(), vec!["c2".to_string(), "c3".to_string()]);

    sandbox.remove_container("c2");
    assert_eq!(sandbox.containers(), vec!["c3".to_string()]);
}

#[tokio::test]
async fn test_labels_and_annotations() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("meta")).await.unwrap();

    let original = sandbox.sandbox_config();
    sandbox.add_annotation("io.podbox/owner", "ops");
    sandbox.add_label("tier", "frontend");
    sandbox.remove_label("app");

    let updated = sandbox.sandbox_config();
    assert_eq!(
        updated.annotations.get("io.podbox/owner").map(String::as_str),
        Some("ops")
    );
    assert!(updated.labels.contains_key("tier"));
    assert!(!updated.labels.contains_key("app"));
    // Earlier handles keep their snapshot.
    assert!(original.labels.contains_key("app"));

    sandbox.remove_annotation("io.podbox/owner");
    assert!(sandbox.sandbox_config().annotations.is_empty());
}

#[tokio::test]
async fn test_network_settings() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("net")).await.unwrap();
    assert!(!sandbox.network_ready());

    let settings = r#"{"ip":"10.88.0.7","gateway":"10.88.0.1"}"#;
    sandbox.update_network_settings(settings).await.unwrap();
    assert!(sandbox.network_ready());
    assert_eq!(sandbox.network_settings(), settings);

    let persisted: serde_json::Value = serde_json::from_slice(
        &std::fs::read(sandbox.network_settings_json_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted["network_ready"], true);
    assert_eq!(persisted["network_settings"], settings);

    sandbox.update_network_settings("null").await.unwrap();
    assert!(!sandbox.network_ready());
    assert!(sandbox.network_settings().is_empty());

    sandbox.set_network_ready(true);
    assert!(sandbox.network_ready());
    assert!(sandbox.status().network_ready);
    sandbox.set_network_ready(false);
    assert!(!sandbox.status().network_ready);

    let err = sandbox.update_network_settings("").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidNetworkSettings(_)));
    let err = sandbox.update_network_settings("{oops").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidNetworkSettings(_)));
}

#[tokio::test]
async fn test_stats_info_swap() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = manager.create(params("stats")).await.unwrap();

    let sample = podbox_core::StatsInfo {
        timestamp: Some(Utc::now()),
        cpu_use_nanos: 1_500_000,
    };
    let previous = sandbox.update_stats_info(sample);
    assert_eq!(previous, podbox_core::StatsInfo::default());
    assert_eq!(sandbox.stats_info(), sample);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let config = manager_config(&dir);
    let manager = SandboxManager::new(config.clone(), controllers(&fake));
    let sandbox = running_sandbox(&manager, "durable").await;
    sandbox.add_container("c1");
    sandbox.add_container("c2");
    sandbox
        .update_network_settings(r#"{"ip":"10.88.0.9"}"#)
        .await
        .unwrap();
    sandbox.save().await.unwrap();

    let loaded = Sandbox::load(
        sandbox.id(),
        &config.sandbox_root_base(),
        &config.sandbox_state_base(),
        &controllers(&fake),
    )
    .await
    .unwrap();

    assert_eq!(loaded.id(), sandbox.id());
    assert_eq!(loaded.name(), "durable");
    assert_eq!(loaded.sandboxer(), "fake");
    assert_eq!(loaded.state().snapshot(), sandbox.state().snapshot());
    assert_eq!(loaded.containers(), sandbox.containers());
    assert_eq!(loaded.network_settings(), sandbox.network_settings());
    assert!(loaded.network_ready());
    assert_eq!(loaded.task_address(), sandbox.task_address());
    assert_eq!(loaded.netns_path(), "/var/run/netns/durable");
    assert_eq!(*loaded.sandbox_config(), *sandbox.sandbox_config());
    assert_eq!(loaded.rootdir(), sandbox.rootdir());
}

#[tokio::test]
async fn test_load_restores_interrupted_removal_as_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let config = manager_config(&dir);
    let manager = SandboxManager::new(config.clone(), controllers(&fake));
    let sandbox = manager.create(params("halfway")).await.unwrap();

    let path = sandbox.state_json_path();
    let mut doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    doc["status"] = serde_json::Value::from("removing");
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let loaded = Sandbox::load(
        sandbox.id(),
        &config.sandbox_root_base(),
        &config.sandbox_state_base(),
        &controllers(&fake),
    )
    .await
    .unwrap();
    assert_eq!(loaded.state().status(), SandboxStatus::Stopped);
    loaded.remove(false).await.unwrap();
}

#[tokio::test]
async fn test_load_unknown_sandboxer() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let config = manager_config(&dir);
    let manager = SandboxManager::new(config.clone(), controllers(&fake));
    let sandbox = manager.create(params("orphan")).await.unwrap();

    let err = Sandbox::load(
        sandbox.id(),
        &config.sandbox_root_base(),
        &config.sandbox_state_base(),
        &ControllerManager::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::UnknownSandboxer(s) if s == "fake"));
}

// ============================================================================
// Reconciliation
// ============================================================================

fn backend_status(state: ControllerSandboxState, exit_status: u32) -> ControllerSandboxStatus {
    ControllerSandboxStatus {
        id: String::new(),
        pid: FAKE_PID,
        state,
        task_address: String::new(),
        created_at: None,
        exited_at: (state == ControllerSandboxState::NotReady).then(Utc::now),
        exit_status,
        info: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_update_status_applies_backend_exit() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "drift").await;
    let task_address = sandbox.task_address();

    fake.set_status_reply(backend_status(ControllerSandboxState::NotReady, 2));
    sandbox.update_status().await.unwrap();

    assert_eq!(sandbox.state().status(), SandboxStatus::Stopped);
    assert_eq!(sandbox.state().exit_status(), 2);
    assert!(sandbox.state().updated_at().is_some());
    // An empty backend address keeps the cached one.
    assert_eq!(sandbox.task_address(), task_address);
}

#[tokio::test]
async fn test_update_status_surfaces_backend_error() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);
    let sandbox = running_sandbox(&manager, "lost").await;

    let err = sandbox.update_status().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Controller(ControllerError::NotFound(_))
    ));
    assert_eq!(sandbox.state().status(), SandboxStatus::Running);
}

// ============================================================================
// Manager
// ============================================================================

#[tokio::test]
async fn test_manager_rejects_duplicate_name() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    manager.create(params("dup")).await.unwrap();
    let err = manager.create(params("dup")).await.unwrap_err();
    assert!(matches!(err, CoreError::NameConflict(n) if n == "dup"));
    assert_eq!(manager.count().await, 1);
    assert_eq!(fake.creates.load(Ordering::SeqCst), 1);
    assert!(manager.get_by_name("dup").await.is_some());
}

#[tokio::test]
async fn test_manager_enforces_limit() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let mut config = manager_config(&dir);
    config.max_sandboxes = 1;
    let manager = SandboxManager::new(config, controllers(&fake));

    manager.create(params("one")).await.unwrap();
    let err = manager.create(params("two")).await.unwrap_err();
    assert!(matches!(err, CoreError::LimitReached(1)));
}

#[tokio::test]
async fn test_manager_cleans_up_failed_create() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    fake.fail_create.store(true, Ordering::SeqCst);
    let manager = manager(&dir, &fake);

    let err = manager.create(params("broken")).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Controller(ControllerError::Backend(_))
    ));
    assert_eq!(manager.count().await, 0);

    let state_base = manager.config().sandbox_state_base();
    let leftovers: Vec<_> = std::fs::read_dir(&state_base)
        .map(|entries| entries.collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_manager_restore() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let before = manager(&dir, &fake);
    let running = running_sandbox(&before, "alpha").await;
    let created = before.create(params("beta")).await.unwrap();

    // Daemon restart: new manager, new backend with no record of anything.
    let fresh = FakeController::new();
    let after = manager(&dir, &fresh);
    assert_eq!(after.restore().await.unwrap(), 2);
    assert_eq!(after.count().await, 2);

    let alpha = after.get(running.id()).await.unwrap();
    assert_eq!(alpha.state().status(), SandboxStatus::Running);
    assert_eq!(alpha.state().pid(), FAKE_PID);
    let beta = after.get_by_name("beta").await.unwrap();
    assert_eq!(beta.id(), created.id());
    assert_eq!(beta.state().status(), SandboxStatus::Created);

    // Restored sandboxes take exit notifications from their backend.
    fresh.trigger_exit(alpha.id().as_str(), 1).await;
    assert_eq!(alpha.state().status(), SandboxStatus::Stopped);

    // Restoring again skips sandboxes already tracked.
    assert_eq!(after.restore().await.unwrap(), 0);
}

#[tokio::test]
async fn test_manager_rejects_duplicate_id() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeController::new();
    let manager = manager(&dir, &fake);

    let id = podbox_core::SandboxId::new();
    let first = manager
        .create(SandboxParams {
            id: Some(id.clone()),
            ..params("first")
        })
        .await
        .unwrap();
    first.start().await.unwrap();

    let err = manager
        .create(SandboxParams {
            id: Some(id.clone()),
            ..params("second")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IdConflict(ref dup) if *dup == id));

    // The rejected attempt must not steal the live sandbox's exit callback.
    fake.trigger_exit(id.as_str(), 1).await;
    assert_eq!(first.state().status(), SandboxStatus::Stopped);
}
