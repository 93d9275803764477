//! # berth-runtime
//!
//! Turns a manifest command into a running process: builds (or reuses) the
//! container image, attaches and initializes volumes, resolves the
//! environment and launches the command through the sandbox.

#![warn(missing_docs)]

pub mod config;
pub mod runner;
pub mod signals;
pub mod volume;

pub use config::{DEFAULT_REAP_TIMEOUT, RuntimeConfig};
pub use runner::{PreparedCommand, Runner};
pub use signals::ExternalSignals;
pub use volume::{InitCommand, MountHandle, VolumeManager};
