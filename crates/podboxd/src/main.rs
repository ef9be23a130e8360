//! podbox daemon entry point.
//!
//! Registers the shim backend, restores every sandbox persisted under the
//! state directory, reconciles each with its backend and then waits for a
//! shutdown signal. Sandboxes are left running on shutdown so they survive
//! a daemon restart.

mod config;

use anyhow::Context;
use config::DaemonConfig;
use podbox_core::{ControllerManager, SandboxManager};
use podbox_shim::ShimController;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sandboxer name the shim backend is registered under.
const SHIM_SANDBOXER: &str = "shim";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("podboxd=info".parse()?)
                .add_directive("podbox_core=info".parse()?)
                .add_directive("podbox_shim=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting podbox daemon");

    let config = DaemonConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let manager_config = config.manager_config();
    for dir in [
        manager_config.sandbox_root_base(),
        manager_config.sandbox_state_base(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let shim = ShimController::new(config.shim_config()).context("creating shim controller")?;
    let controllers = ControllerManager::new().with_controller(SHIM_SANDBOXER, Arc::new(shim));
    let manager = SandboxManager::new(manager_config, Arc::new(controllers));

    let restored = manager
        .restore()
        .await
        .context("restoring persisted sandboxes")?;
    tracing::info!(restored, "Daemon ready");

    wait_for_shutdown().await?;
    tracing::info!(
        sandboxes = manager.count().await,
        "Received shutdown signal, leaving sandboxes in place"
    );

    tracing::info!("Daemon shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
