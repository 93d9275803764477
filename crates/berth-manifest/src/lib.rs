//! # berth-manifest
//!
//! Data model of `berth.yaml` and the read-only registry used to resolve
//! container and command names.
//!
//! Setup steps, volume kinds and command kinds are closed sum types; every
//! consumer dispatches on them with a single exhaustive `match`.

#![warn(missing_docs)]

pub mod command;
pub mod container;
pub mod environ;
pub mod manifest;
pub mod mode;
pub mod volume;

pub use command::{
    ChildCommand, CommandSpec, RunMode, RunScript, SingleCommand, SupervisedCommand,
    SupervisionMode,
};
pub use container::{ContainerSpec, CopyStep, Distribution, SetupStep, UserStep};
pub use environ::Environ;
pub use manifest::{MANIFEST_FILE, Manifest};
pub use mode::FileMode;
pub use volume::{PersistentVolume, SubdirSpec, TmpfsVolume, VolumeSpec};
