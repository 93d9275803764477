//! Volume manager.
//!
//! Persistent volumes live under `<root>/volumes/<name>`. A missing volume is
//! prepared in `volumes/.tmp`, handed to its init command and renamed into
//! place only when the command succeeds, so an existing directory always
//! means "initialized". Tmpfs volumes are fresh scratch directories that are
//! removed when their handle drops.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_common::{BerthPaths, RunId, VolumeError, VolumeResult};
use berth_manifest::{PersistentVolume, TmpfsVolume, VolumeSpec};
use berth_sandbox::{LaunchSpec, Launcher, Mount};
use dashmap::DashMap;
use fs2::FileExt;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// An attached volume, ready to be bind-mounted.
#[derive(Debug)]
pub enum MountHandle {
    /// A named persistent volume.
    Persistent {
        /// Volume name.
        name: String,
        /// Backing store on the host.
        path: PathBuf,
        /// Mount point inside the container.
        mount_point: PathBuf,
        /// Whether the backing store exists.
        initialized: bool,
    },
    /// A scratch directory, deleted on drop.
    Tmpfs {
        /// Scratch directory on the host.
        dir: TempDir,
        /// Mount point inside the container.
        mount_point: PathBuf,
    },
}

impl MountHandle {
    /// Host directory to mount.
    #[must_use]
    pub fn source(&self) -> &Path {
        match self {
            Self::Persistent { path, .. } => path,
            Self::Tmpfs { dir, .. } => dir.path(),
        }
    }

    /// Mount point inside the container.
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        match self {
            Self::Persistent { mount_point, .. } | Self::Tmpfs { mount_point, .. } => mount_point,
        }
    }

    /// Whether the volume can be mounted as is.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        match self {
            Self::Persistent { initialized, .. } => *initialized,
            Self::Tmpfs { .. } => true,
        }
    }

    /// Bind mount for the launcher.
    #[must_use]
    pub fn to_mount(&self) -> Mount {
        Mount::bind(self.source(), self.mount_point())
    }
}

/// A fully prepared init command.
///
/// The manager adds the volume mount, working directory and owner ids.
#[derive(Debug, Clone)]
pub struct InitCommand {
    /// Command name, for errors.
    pub name: String,
    /// Launch description in the command's image.
    pub launch: LaunchSpec,
    /// Launcher to run it with.
    pub launcher: Arc<dyn Launcher>,
}

/// Attaches and initializes volumes.
#[derive(Debug)]
pub struct VolumeManager {
    paths: BerthPaths,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VolumeManager {
    /// Create a manager over `paths`.
    #[must_use]
    pub fn new(paths: BerthPaths) -> Self {
        Self {
            paths,
            locks: DashMap::new(),
        }
    }

    /// Resolve a volume to a host directory.
    ///
    /// Persistent volumes are only looked up; [`Self::maybe_initialize`]
    /// creates them. Tmpfs volumes are created here.
    ///
    /// # Errors
    ///
    /// Returns an error if a tmpfs directory cannot be created.
    pub fn attach(&self, volume: &VolumeSpec, mount_point: &Path) -> VolumeResult<MountHandle> {
        match volume {
            VolumeSpec::Persistent(persistent) => {
                let path = self.paths.volume(&persistent.name);
                let initialized = path.is_dir();
                tracing::debug!(
                    volume = %persistent.name,
                    mount_point = %mount_point.display(),
                    initialized,
                    "Attached persistent volume"
                );
                Ok(MountHandle::Persistent {
                    name: persistent.name.clone(),
                    path,
                    mount_point: mount_point.to_path_buf(),
                    initialized,
                })
            }
            VolumeSpec::Tmpfs(tmpfs) => self.attach_tmpfs(tmpfs, mount_point),
        }
    }

    fn attach_tmpfs(&self, tmpfs: &TmpfsVolume, mount_point: &Path) -> VolumeResult<MountHandle> {
        let base = self.paths.tmpfs();
        fs::create_dir_all(&base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", std::process::id()))
            .tempdir_in(&base)?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(tmpfs.mode.bits()))?;
        for (subdir, spec) in &tmpfs.subdirs {
            let path = dir.path().join(subdir);
            fs::create_dir_all(&path)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(spec.mode.bits()))?;
        }
        tracing::debug!(
            path = %dir.path().display(),
            mount_point = %mount_point.display(),
            subdirs = tmpfs.subdirs.len(),
            "Created tmpfs volume"
        );
        Ok(MountHandle::Tmpfs {
            dir,
            mount_point: mount_point.to_path_buf(),
        })
    }

    /// Create and initialize a persistent volume if it does not exist yet.
    ///
    /// The init command runs at most once per volume lifetime: concurrent
    /// callers in this process wait on a per-volume lock, other processes are
    /// refused with [`VolumeError::VolumeBusy`] while one holds the volume's
    /// file lock.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InitCommandFailed`] when the init command exits
    /// non-zero; the volume is then left uninitialized.
    pub async fn maybe_initialize(
        &self,
        volume: &PersistentVolume,
        handle: &mut MountHandle,
        init: Option<&InitCommand>,
    ) -> VolumeResult<()> {
        let MountHandle::Persistent {
            path, initialized, mount_point, ..
        } = handle
        else {
            return Ok(());
        };
        if *initialized {
            return Ok(());
        }

        let lock = self.locks.entry(volume.name.clone()).or_default().clone();
        let _guard = lock.lock().await;

        fs::create_dir_all(self.paths.volume_scratch())?;
        let _file_lock = LockFile::acquire(&self.paths.volume_lock(&volume.name), &volume.name)?;

        if path.is_dir() {
            tracing::debug!(volume = %volume.name, "Volume initialized concurrently");
            *initialized = true;
            return Ok(());
        }

        let scratch = self.paths.volume_scratch().join(RunId::generate().as_str());
        fs::create_dir(&scratch)?;
        let result = self
            .initialize(volume, &scratch, mount_point, init)
            .await
            .and_then(|()| fs::rename(&scratch, &*path).map_err(VolumeError::from));
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&scratch) {
                tracing::warn!(path = %scratch.display(), error = %cleanup, "Failed to remove volume scratch");
            }
            return Err(e);
        }

        tracing::info!(volume = %volume.name, path = %path.display(), "Volume initialized");
        *initialized = true;
        Ok(())
    }

    async fn initialize(
        &self,
        volume: &PersistentVolume,
        scratch: &Path,
        mount_point: &Path,
        init: Option<&InitCommand>,
    ) -> VolumeResult<()> {
        set_owner(scratch, volume.owner_uid, volume.owner_gid)?;

        let Some(init) = init else {
            return Ok(());
        };
        tracing::info!(
            volume = %volume.name,
            command = %init.name,
            uid = volume.owner_uid,
            gid = volume.owner_gid,
            "Running volume init command"
        );

        let spec = init
            .launch
            .clone()
            .mount(Mount::bind(scratch, mount_point))
            .workdir(mount_point)
            .user(volume.owner_uid, volume.owner_gid);
        let launch_failed = |source| VolumeError::InitLaunch {
            volume: volume.name.clone(),
            source,
        };
        let mut process = init.launcher.spawn(&spec).map_err(launch_failed)?;
        let exit = process.wait().await.map_err(launch_failed)?;
        if !exit.success() {
            return Err(VolumeError::InitCommandFailed {
                volume: volume.name.clone(),
                exit_code: exit.code(),
            });
        }
        Ok(())
    }

    /// Remove tmpfs directories left behind by berth processes that no longer run.
    ///
    /// Returns how many were removed.
    pub fn sweep_tmpfs(&self) -> usize {
        let Ok(entries) = fs::read_dir(self.paths.tmpfs()) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let owner = name
                .to_str()
                .and_then(|n| n.split_once('.'))
                .and_then(|(pid, _)| pid.parse::<u32>().ok());
            if owner.is_some_and(|pid| !process_alive(pid)) {
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::debug!(path = %entry.path().display(), error = %e, "Failed to sweep tmpfs");
                    }
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept stale tmpfs volumes");
        }
        removed
    }
}

fn set_owner(path: &Path, uid: u32, gid: u32) -> VolumeResult<()> {
    let current = (
        rustix::process::geteuid().as_raw(),
        rustix::process::getegid().as_raw(),
    );
    if (uid, gid) == current {
        return Ok(());
    }
    if !rustix::process::geteuid().is_root() {
        tracing::warn!(
            path = %path.display(),
            uid,
            gid,
            "Not root; volume stays owned by the current user"
        );
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|source| {
        VolumeError::OwnershipChangeFailed {
            path: path.to_path_buf(),
            uid,
            gid,
            source,
        }
    })
}

/// Whether a process with `pid` exists.
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Exclusive `flock` on a volume's lock file, released on drop.
///
/// The file is never removed; its content is the holder's pid and only
/// feeds error messages.
#[derive(Debug)]
struct LockFile {
    file: fs::File,
}

impl LockFile {
    fn acquire(path: &Path, volume: &str) -> VolumeResult<Self> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                return Err(e.into());
            }
            let pid = fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            return Err(VolumeError::VolumeBusy {
                volume: volume.to_string(),
                pid,
            });
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(error = %e, "Failed to release volume lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use berth_manifest::{FileMode, SubdirSpec};

    use super::*;

    fn manager() -> (tempfile::TempDir, VolumeManager) {
        let temp = tempfile::tempdir().unwrap();
        let manager = VolumeManager::new(BerthPaths::with_root(temp.path()));
        (temp, manager)
    }

    fn persistent(name: &str) -> PersistentVolume {
        PersistentVolume {
            name: name.to_string(),
            owner_uid: rustix::process::geteuid().as_raw(),
            owner_gid: rustix::process::getegid().as_raw(),
            init_command: None,
        }
    }

    #[test]
    fn tmpfs_subdirs_and_cleanup() {
        let (_temp, manager) = manager();
        let spec = VolumeSpec::Tmpfs(TmpfsVolume {
            mode: FileMode(0o755),
            subdirs: BTreeMap::from([
                (PathBuf::from("cache"), SubdirSpec { mode: FileMode(0o700) }),
                (PathBuf::from("a/b"), SubdirSpec::default()),
            ]),
        });

        let handle = manager.attach(&spec, Path::new("/tmp")).unwrap();
        let source = handle.source().to_path_buf();
        assert!(handle.is_ready());
        assert_eq!(handle.to_mount().target, PathBuf::from("/tmp"));
        let mode = fs::metadata(source.join("cache")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(source.join("a/b").is_dir());

        drop(handle);
        assert!(!source.exists());
    }

    #[test_log::test(tokio::test)]
    async fn persistent_without_init_is_created_once() {
        let (temp, manager) = manager();
        let volume = persistent("data");
        let spec = VolumeSpec::Persistent(volume.clone());

        let mut handle = manager.attach(&spec, Path::new("/data")).unwrap();
        assert!(!handle.is_ready());
        manager.maybe_initialize(&volume, &mut handle, None).await.unwrap();
        assert!(handle.is_ready());
        assert!(temp.path().join("volumes/data").is_dir());
        assert!(temp.path().join("volumes/.data.lock").exists());

        fs::write(temp.path().join("volumes/data/keep"), "x").unwrap();
        let mut again = manager.attach(&spec, Path::new("/data")).unwrap();
        assert!(again.is_ready());
        manager.maybe_initialize(&volume, &mut again, None).await.unwrap();
        assert!(temp.path().join("volumes/data/keep").exists());
    }

    #[test]
    fn held_lock_means_busy_even_before_pid_is_written() {
        let (temp, _manager) = manager();
        let lock = temp.path().join("busy.lock");
        let holder = fs::File::create(&lock).unwrap();
        holder.try_lock_exclusive().unwrap();

        match LockFile::acquire(&lock, "busy") {
            Err(VolumeError::VolumeBusy { pid, .. }) => assert_eq!(pid, None),
            other => panic!("expected busy, got {other:?}"),
        }

        fs::write(&lock, "4242\n").unwrap();
        match LockFile::acquire(&lock, "busy") {
            Err(VolumeError::VolumeBusy { pid, .. }) => assert_eq!(pid, Some(4242)),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn leftover_lock_file_is_reused() {
        let (temp, _manager) = manager();
        let lock = temp.path().join("stale.lock");
        fs::write(&lock, format!("{}\n", i32::MAX)).unwrap();

        let held = LockFile::acquire(&lock, "stale").unwrap();
        let owner = fs::read_to_string(&lock).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
        assert!(matches!(
            LockFile::acquire(&lock, "stale"),
            Err(VolumeError::VolumeBusy { .. })
        ));

        drop(held);
        drop(LockFile::acquire(&lock, "stale").unwrap());
    }

    #[test]
    fn sweep_removes_dead_owners_only() {
        let (temp, manager) = manager();
        let tmpfs = temp.path().join("run/tmpfs");
        fs::create_dir_all(tmpfs.join(format!("{}.dead", i32::MAX))).unwrap();
        fs::create_dir_all(tmpfs.join(format!("{}.live", std::process::id()))).unwrap();
        assert_eq!(manager.sweep_tmpfs(), 1);
        assert!(tmpfs.join(format!("{}.live", std::process::id())).exists());
    }
}
