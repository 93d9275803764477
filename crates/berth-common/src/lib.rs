//! # berth-common
//!
//! Shared utilities and types for berth.
//!
//! This crate provides common functionality used across all berth crates:
//! - Error taxonomy for the build, volume and run stages
//! - Standard filesystem paths
//! - Run identifiers and validated names
//! - Signal names shared by the manifest and the launchers

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod signal;

pub use error::{
    BerthError, BerthResult, BuildError, BuildResult, LaunchError, LaunchResult, ManifestError,
    RunError, RunResult, VolumeError, VolumeResult,
};
pub use id::{Name, RunId};
pub use paths::BerthPaths;
pub use signal::Signal;
