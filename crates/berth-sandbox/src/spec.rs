//! Description of a process to launch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A bind mount applied before the process starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host directory.
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub target: PathBuf,
    /// Mount read-only.
    pub readonly: bool,
}

impl Mount {
    /// Read-write bind mount.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    /// Read-only bind mount.
    pub fn readonly(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            readonly: true,
            ..Self::bind(source, target)
        }
    }
}

/// Everything a launcher needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Image root directory on the host.
    pub root: PathBuf,
    /// Program and arguments; `argv[0]` is resolved inside the root.
    pub argv: Vec<String>,
    /// Complete environment; nothing is inherited from berth.
    pub env: BTreeMap<String, String>,
    /// Working directory inside the container.
    pub workdir: PathBuf,
    /// User id of the process.
    pub uid: u32,
    /// Group id of the process.
    pub gid: u32,
    /// Bind mounts, applied in order.
    pub mounts: Vec<Mount>,
    /// Start the process as leader of a new process group.
    pub new_process_group: bool,
}

impl LaunchSpec {
    /// A root-owned process in `/` of the given root.
    pub fn new(root: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            root: root.into(),
            argv,
            env: BTreeMap::new(),
            workdir: PathBuf::from("/"),
            uid: 0,
            gid: 0,
            mounts: Vec::new(),
            new_process_group: false,
        }
    }

    /// Set the environment.
    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the user and group.
    #[must_use]
    pub const fn user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Add a mount.
    #[must_use]
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Start in a new process group.
    #[must_use]
    pub const fn process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    /// Program name for logs and errors.
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// The mount whose target contains `path`, preferring the deepest one.
    #[must_use]
    pub fn mount_for(&self, path: &Path) -> Option<&Mount> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.target))
            .max_by_key(|m| m.target.components().count())
    }
}
