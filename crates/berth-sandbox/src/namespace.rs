//! Launcher using Linux namespaces.
//!
//! Each process gets a private mount namespace (and optionally a network
//! namespace with only loopback). Volumes and the host's `/proc`, `/dev` and
//! `/sys` are bind-mounted under the image root, then the process is
//! chrooted into it.
//!
//! When berth is not root a user namespace maps the caller to uid 0, so the
//! same setup works rootless. Rootless processes always run as the mapped
//! root.
//!
//! All setup happens in the forked child before `exec`, so it only touches
//! buffers prepared in the parent.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use berth_common::paths::resolve_inside;
use berth_common::{LaunchError, LaunchResult};
use rustix::mount::{MountFlags, MountPropagationFlags};
use rustix::thread::UnshareFlags;

use crate::Launcher;
use crate::process::Process;
use crate::spec::LaunchSpec;

/// Host directories bound into every container.
const SYSTEM_MOUNTS: &[&str] = &["/proc", "/dev", "/sys"];

/// Namespace options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Give each process its own network namespace with only loopback.
    pub isolate_network: bool,
}

/// Runs processes chrooted into the image inside fresh namespaces.
#[derive(Debug, Clone)]
pub struct NamespaceLauncher {
    config: NamespaceConfig,
    rootless: Option<IdMaps>,
}

#[derive(Debug, Clone)]
struct IdMaps {
    uid_map: String,
    gid_map: String,
}

struct BindMount {
    source: CString,
    target: CString,
    recursive: bool,
    readonly: bool,
}

/// Child-side setup, fully materialized before fork.
struct Prepared {
    root: CString,
    workdir: CString,
    mounts: Vec<BindMount>,
    id_maps: Option<(CString, CString)>,
    isolate_network: bool,
    uid: u32,
    gid: u32,
}

impl NamespaceLauncher {
    /// Create a namespace launcher.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Unsupported`] when running rootless on a host
    /// that disables unprivileged user namespaces.
    pub fn new(config: NamespaceConfig) -> LaunchResult<Self> {
        let rootless = if rustix::process::geteuid().is_root() {
            None
        } else {
            if !user_namespaces_enabled() {
                return Err(LaunchError::Unsupported {
                    reason: "unprivileged user namespaces are disabled on this host".to_string(),
                });
            }
            Some(IdMaps {
                uid_map: format!("0 {} 1\n", rustix::process::getuid().as_raw()),
                gid_map: format!("0 {} 1\n", rustix::process::getgid().as_raw()),
            })
        };
        Ok(Self { config, rootless })
    }

    /// Whether processes run in a user namespace.
    #[must_use]
    pub const fn is_rootless(&self) -> bool {
        self.rootless.is_some()
    }

    fn prepare(&self, spec: &LaunchSpec) -> LaunchResult<Prepared> {
        if !spec.root.is_dir() {
            return Err(LaunchError::InvalidPath {
                path: spec.root.clone(),
            });
        }

        let mut mounts = Vec::with_capacity(spec.mounts.len() + SYSTEM_MOUNTS.len());
        for system in SYSTEM_MOUNTS {
            let target = mount_target(&spec.root, Path::new(system), spec)?;
            ensure_dir(&target, spec)?;
            mounts.push(BindMount {
                source: cstring(Path::new(system))?,
                target: cstring(&target)?,
                recursive: true,
                readonly: false,
            });
        }
        for mount in &spec.mounts {
            let target = mount_target(&spec.root, &mount.target, spec)?;
            ensure_dir(&target, spec)?;
            mounts.push(BindMount {
                source: cstring(&mount.source)?,
                target: cstring(&target)?,
                recursive: false,
                readonly: mount.readonly,
            });
        }

        let (uid, gid) = if self.rootless.is_some() {
            if (spec.uid, spec.gid) != (0, 0) {
                tracing::warn!(
                    uid = spec.uid,
                    gid = spec.gid,
                    "Rootless namespace; running as mapped root instead"
                );
            }
            (0, 0)
        } else {
            (spec.uid, spec.gid)
        };

        let id_maps = match &self.rootless {
            Some(maps) => Some((
                CString::new(maps.uid_map.clone()).map_err(|_| invalid(&spec.root))?,
                CString::new(maps.gid_map.clone()).map_err(|_| invalid(&spec.root))?,
            )),
            None => None,
        };

        Ok(Prepared {
            root: cstring(&spec.root)?,
            workdir: cstring(&spec.workdir)?,
            mounts,
            id_maps,
            isolate_network: self.config.isolate_network,
            uid,
            gid,
        })
    }

    fn command(&self, spec: &LaunchSpec) -> LaunchResult<Command> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(LaunchError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        let prepared = self.prepare(spec)?;

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(&spec.env);
        if spec.new_process_group {
            cmd.process_group(0);
        }

        // SAFETY: `enter` only issues syscalls on buffers owned by `prepared`
        // and does not allocate.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || enter(&prepared));
        }
        Ok(cmd)
    }
}

impl Launcher for NamespaceLauncher {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn spawn(&self, spec: &LaunchSpec) -> LaunchResult<Process> {
        let cmd = self.command(spec)?;
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
            rootless = self.is_rootless(),
            network = self.config.isolate_network,
            "Spawned namespaced process"
        );
        Ok(process)
    }

    fn exec(&self, spec: &LaunchSpec) -> LaunchError {
        let mut cmd = match self.command(spec) {
            Ok(cmd) => cmd,
            Err(e) => return e,
        };
        LaunchError::Exec {
            program: spec.program().to_string(),
            source: cmd.exec(),
        }
    }
}

/// Runs in the forked child.
fn enter(p: &Prepared) -> std::io::Result<()> {
    let mut flags = UnshareFlags::NEWNS;
    if p.id_maps.is_some() {
        flags |= UnshareFlags::NEWUSER;
    }
    if p.isolate_network {
        flags |= UnshareFlags::NEWNET;
    }
    // SAFETY: the child is single-threaded between fork and exec.
    #[allow(unsafe_code)]
    unsafe {
        rustix::thread::unshare_unsafe(flags)?;
    }

    if let Some((uid_map, gid_map)) = &p.id_maps {
        write_proc(c"/proc/self/setgroups", b"deny")?;
        write_proc(c"/proc/self/uid_map", uid_map.as_bytes())?;
        write_proc(c"/proc/self/gid_map", gid_map.as_bytes())?;
    }

    rustix::mount::mount_change(
        c"/",
        MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
    )?;

    for m in &p.mounts {
        if m.recursive {
            rustix::mount::mount_bind_recursive(m.source.as_c_str(), m.target.as_c_str())?;
        } else {
            rustix::mount::mount_bind(m.source.as_c_str(), m.target.as_c_str())?;
        }
        if m.readonly {
            rustix::mount::mount_remount(
                m.target.as_c_str(),
                MountFlags::BIND | MountFlags::RDONLY,
                c"",
            )?;
        }
    }

    if p.isolate_network {
        loopback_up()?;
    }

    rustix::process::chroot(p.root.as_c_str())?;
    rustix::process::chdir(c"/")?;
    rustix::process::chdir(p.workdir.as_c_str())?;

    if p.id_maps.is_none() {
        drop_privileges(p.uid, p.gid)?;
    }
    Ok(())
}

#[allow(unsafe_code)]
fn drop_privileges(uid: u32, gid: u32) -> std::io::Result<()> {
    // SAFETY: plain syscalls with no pointers except the empty group list.
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0
            || libc::setgid(gid) != 0
            || libc::setuid(uid) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[allow(unsafe_code)]
fn write_proc(path: &CStr, data: &[u8]) -> std::io::Result<()> {
    // SAFETY: `path` is NUL-terminated and `data` outlives the call.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written = libc::write(fd, data.as_ptr().cast(), data.len());
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if written < 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Bring `lo` up in a fresh network namespace.
#[allow(unsafe_code)]
fn loopback_up() -> std::io::Result<()> {
    // SAFETY: `ifreq` is plain data; the socket is closed on every path.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut req: libc::ifreq = std::mem::zeroed();
        for (dst, src) in req.ifr_name.iter_mut().zip(b"lo") {
            *dst = *src as libc::c_char;
        }
        req.ifr_ifru.ifru_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        let ret = libc::ioctl(fd, libc::SIOCSIFFLAGS, &req);
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if ret < 0 {
            return Err(err);
        }
    }
    Ok(())
}

fn user_namespaces_enabled() -> bool {
    let disabled = |path: &str| {
        std::fs::read_to_string(path)
            .map(|v| v.trim() == "0")
            .unwrap_or(false)
    };
    !disabled("/proc/sys/kernel/unprivileged_userns_clone")
        && !disabled("/proc/sys/user/max_user_namespaces")
}

/// Host location of a mount point, with image symlinks kept inside `root`.
fn mount_target(root: &Path, target: &Path, spec: &LaunchSpec) -> LaunchResult<PathBuf> {
    resolve_inside(root, target, true).map_err(|source| LaunchError::Spawn {
        program: spec.program().to_string(),
        source,
    })
}

fn ensure_dir(path: &Path, spec: &LaunchSpec) -> LaunchResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|source| LaunchError::Spawn {
        program: spec.program().to_string(),
        source,
    })
}

fn cstring(path: &Path) -> LaunchResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| invalid(path))
}

fn invalid(path: &Path) -> LaunchError {
    LaunchError::InvalidPath {
        path: path.to_path_buf(),
    }
}
