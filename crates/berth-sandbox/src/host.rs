//! Launcher without isolation.
//!
//! Processes run on the host filesystem. The working directory is mapped
//! onto the host: paths under a mount target resolve into the mount source,
//! anything else resolves into the image root. Programs are looked up on the
//! host `PATH` from the launch environment.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use berth_common::paths::join_inside;
use berth_common::{LaunchError, LaunchResult};

use crate::Launcher;
use crate::process::Process;
use crate::spec::LaunchSpec;

/// Environment variable pointing at the image root, set only by this launcher.
pub const IMAGE_ROOT_ENV: &str = "BERTH_IMAGE_ROOT";

/// Runs processes directly on the host.
#[derive(Debug, Clone, Default)]
pub struct HostLauncher {
    _private: (),
}

impl HostLauncher {
    /// Create a host launcher.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Host location of an in-container path.
    #[must_use]
    pub fn host_path(spec: &LaunchSpec, path: &Path) -> PathBuf {
        match spec.mount_for(path) {
            Some(mount) => {
                let rest = path.strip_prefix(&mount.target).unwrap_or(Path::new(""));
                if rest.as_os_str().is_empty() {
                    mount.source.clone()
                } else {
                    mount.source.join(rest)
                }
            }
            None => join_inside(&spec.root, path),
        }
    }

    fn command(spec: &LaunchSpec) -> LaunchResult<Command> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(LaunchError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&spec.env)
            .env(IMAGE_ROOT_ENV, &spec.root)
            .current_dir(Self::host_path(spec, &spec.workdir));

        if rustix::process::geteuid().is_root() {
            cmd.uid(spec.uid).gid(spec.gid);
        } else if spec.uid != rustix::process::getuid().as_raw() {
            tracing::debug!(
                uid = spec.uid,
                gid = spec.gid,
                "Not root; running as the current user"
            );
        }

        if spec.new_process_group {
            cmd.process_group(0);
        }
        Ok(cmd)
    }
}

impl Launcher for HostLauncher {
    fn name(&self) -> &'static str {
        "host"
    }

    fn spawn(&self, spec: &LaunchSpec) -> LaunchResult<Process> {
        let cmd = Self::command(spec)?;
        let child = tokio::process::Command::from(cmd)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: spec.program().to_string(),
                source,
            })?;
        let process = Process::new(child, spec.program(), spec.new_process_group)?;
        tracing::debug!(
            pid = process.pid(),
            program = spec.program(),
            root = %spec.root.display(),
            workdir = %spec.workdir.display(),
            "Spawned host process"
        );
        Ok(process)
    }

    fn exec(&self, spec: &LaunchSpec) -> LaunchError {
        let mut cmd = match Self::command(spec) {
            Ok(cmd) => cmd,
            Err(e) => return e,
        };
        tracing::debug!(program = spec.program(), "Replacing process");
        LaunchError::Exec {
            program: spec.program().to_string(),
            source: cmd.exec(),
        }
    }
}
