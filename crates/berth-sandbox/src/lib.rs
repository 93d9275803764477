//! # berth-sandbox
//!
//! Starts processes inside an image root with a given environment, working
//! directory, uid/gid and mount set.
//!
//! Two launchers implement [`Launcher`]:
//! - [`NamespaceLauncher`]: private mount namespace, bind mounts, `chroot`,
//!   optional network namespace with loopback only. Uses a user namespace
//!   when not root.
//! - [`HostLauncher`]: no isolation. Container paths are mapped onto their
//!   host locations; used in tests and where namespaces are unavailable.

#![warn(missing_docs)]

pub mod host;
pub mod namespace;
pub mod process;
pub mod spec;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use berth_common::{LaunchError, LaunchResult};

pub use host::HostLauncher;
pub use namespace::{NamespaceConfig, NamespaceLauncher};
pub use process::{Process, ProcessExit};
pub use spec::{LaunchSpec, Mount};

/// Starts processes described by a [`LaunchSpec`].
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Start the process and return a handle to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    fn spawn(&self, spec: &LaunchSpec) -> LaunchResult<Process>;

    /// Replace the current process with the launched one.
    ///
    /// Only returns on failure.
    fn exec(&self, spec: &LaunchSpec) -> LaunchError;
}

/// Which launcher to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Namespaces when the host allows them, host otherwise.
    #[default]
    Auto,
    /// Always the host launcher.
    Host,
    /// Always the namespace launcher.
    Namespace,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Host => "host",
            Self::Namespace => "namespace",
        };
        f.write_str(name)
    }
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "host" => Ok(Self::Host),
            "namespace" | "ns" => Ok(Self::Namespace),
            other => Err(format!(
                "unknown isolation {other:?} (expected auto, host or namespace)"
            )),
        }
    }
}

/// Build the launcher for an isolation level.
///
/// # Errors
///
/// Returns [`LaunchError::Unsupported`] when namespaces are requested and
/// the host does not allow them.
pub fn launcher(isolation: Isolation, config: NamespaceConfig) -> LaunchResult<Arc<dyn Launcher>> {
    let launcher: Arc<dyn Launcher> = match isolation {
        Isolation::Host => Arc::new(HostLauncher::new()),
        Isolation::Namespace => Arc::new(NamespaceLauncher::new(config)?),
        Isolation::Auto => match NamespaceLauncher::new(config) {
            Ok(launcher) => Arc::new(launcher),
            Err(LaunchError::Unsupported { reason }) => {
                tracing::warn!(
                    %reason,
                    "Namespaces unavailable; commands run on the host without isolation"
                );
                Arc::new(HostLauncher::new())
            }
            Err(e) => return Err(e),
        },
    };
    tracing::debug!(%isolation, launcher = launcher.name(), "Selected launcher");
    Ok(launcher)
}
