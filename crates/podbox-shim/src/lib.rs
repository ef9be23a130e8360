//! # podbox-shim
//!
//! Pause-process backend for podbox sandboxes.
//!
//! [`ShimController`] implements [`podbox_core::Controller`] by running one
//! long-lived host process per sandbox (by default `sleep infinity`). The
//! process pid is the sandbox pid, its `/proc` entry is the task address, and
//! its exit is reported back to the sandbox through the registered exit
//! callback.
//!
//! ## Quick Start
//!
//! ```no_run
//! use podbox_core::ControllerManager;
//! use podbox_shim::{ShimConfig, ShimController};
//! use std::sync::Arc;
//!
//! # fn example() -> podbox_shim::Result<()> {
//! let shim = ShimController::new(ShimConfig::new("/run/podbox/shim"))?;
//! let controllers = ControllerManager::new().with_controller("shim", Arc::new(shim));
//! assert!(controllers.contains("shim"));
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;

pub use config::{ShimConfig, DEFAULT_KILL_GRACE, DEFAULT_PAUSE_COMMAND};
pub use controller::ShimController;
pub use error::{Result, ShimError};
