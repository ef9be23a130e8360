//! # podbox-core
//!
//! Pod sandbox state tracking and lifecycle control for the podbox daemon.
//!
//! A [`Sandbox`] is the daemon's record of one pod sandbox: its identity,
//! runtime status, network configuration and member containers. It drives
//! the sandbox through create, start, stop and remove by delegating the
//! privileged work to a pluggable [`Controller`], and mirrors itself to disk
//! so the daemon can rebuild it after a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       podbox-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ SandboxManager  │────▶│  HashMap<SandboxId,      │   │
//! │  │   - create()    │     │       Arc<Sandbox>>      │   │
//! │  │   - remove()    │     └──────────────────────────┘   │
//! │  │   - restore()   │                                    │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Sandbox      │────▶│  <statedir>/<id>/        │   │
//! │  │  - create()     │     │   sandbox_metadata.json  │   │
//! │  │  - start()      │     │   sandbox_state.json     │   │
//! │  │  - stop()       │     │   network_settings.json  │   │
//! │  │  - remove()     │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │        │      ▲                                          │
//! │        ▼      │ on_sandbox_exit()                        │
//! │  ┌─────────────────┐                                    │
//! │  │  dyn Controller │  resolved by sandboxer name        │
//! │  └─────────────────┘  through ControllerManager         │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use podbox_core::{ControllerManager, ManagerConfig, SandboxConfig, SandboxManager, SandboxParams};
//! use std::sync::Arc;
//!
//! # async fn example(shim: Arc<dyn podbox_core::Controller>) -> podbox_core::Result<()> {
//! let controllers = Arc::new(ControllerManager::new().with_controller("shim", shim));
//! let manager = SandboxManager::new(
//!     ManagerConfig::new("/var/lib/podbox", "/run/podbox"),
//!     controllers,
//! );
//!
//! let sandbox = manager
//!     .create(SandboxParams {
//!         sandboxer: "shim".into(),
//!         config: SandboxConfig::builder().name("web").namespace("default").build()?,
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! sandbox.start().await?;
//! println!("{:?}", sandbox.status());
//!
//! sandbox.stop(None).await?;
//! manager.remove(sandbox.id(), false).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;
mod manager;
mod persist;
mod sandbox;
mod state;

pub use config::{DnsConfig, SandboxConfig, SandboxConfigBuilder};
pub use controller::{
    Controller, ControllerCreateParams, ControllerError, ControllerExitInfo, ControllerManager,
    ControllerSandboxInfo, ControllerSandboxState, ControllerSandboxStatus, SandboxExitCallback,
};
pub use error::{CoreError, Result};
pub use manager::{ManagerConfig, SandboxManager};
pub use persist::{list_persisted, NETWORK_SETTINGS_JSON, SANDBOX_METADATA_JSON, SANDBOX_STATE_JSON};
pub use sandbox::{Sandbox, SandboxId, SandboxParams, SandboxSnapshot, DEFAULT_STOP_TIMEOUT};
pub use state::{SandboxState, SandboxStatus, StateSnapshot, StatsInfo};
