//! Volume declarations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mode::FileMode;

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSpec {
    /// Durable storage keyed by name, surviving image rebuilds.
    Persistent(PersistentVolume),
    /// Memory-backed scratch space, recreated empty on every run.
    Tmpfs(TmpfsVolume),
}

/// Durable, name-keyed storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PersistentVolume {
    /// Backing store key.
    pub name: String,
    /// Owner of the volume root.
    #[serde(default)]
    pub owner_uid: u32,
    /// Group of the volume root.
    #[serde(default)]
    pub owner_gid: u32,
    /// Command run once, when the volume is first created.
    #[serde(default)]
    pub init_command: Option<String>,
}

/// Ephemeral storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TmpfsVolume {
    /// Mode of the volume root.
    #[serde(default = "default_tmpfs_mode")]
    pub mode: FileMode,
    /// Directories created before the process starts, relative to the root.
    #[serde(default)]
    pub subdirs: BTreeMap<PathBuf, SubdirSpec>,
}

impl Default for TmpfsVolume {
    fn default() -> Self {
        Self {
            mode: default_tmpfs_mode(),
            subdirs: BTreeMap::new(),
        }
    }
}

const fn default_tmpfs_mode() -> FileMode {
    FileMode(0o766)
}

/// A pre-created tmpfs subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubdirSpec {
    /// Permission bits.
    #[serde(default = "default_subdir_mode")]
    pub mode: FileMode,
}

impl Default for SubdirSpec {
    fn default() -> Self {
        Self {
            mode: default_subdir_mode(),
        }
    }
}

const fn default_subdir_mode() -> FileMode {
    FileMode(0o755)
}
