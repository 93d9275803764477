//! Standard filesystem paths for berth.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for berth data.
///
/// `BERTH_ROOT` wins, then the user's local data directory, then `/var/lib/berth`.
pub static BERTH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BERTH_ROOT").map_or_else(
        |_| {
            dirs::data_local_dir()
                .map(|d| d.join("berth"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/berth"))
        },
        PathBuf::from,
    )
});

/// Default runtime directory for berth.
pub static BERTH_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BERTH_RUNTIME_DIR").map_or_else(
        |_| {
            dirs::runtime_dir()
                .map(|d| d.join("berth"))
                .unwrap_or_else(|| BERTH_ROOT.join("run"))
        },
        PathBuf::from,
    )
});

/// Standard paths used by berth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerthPaths {
    /// Root data directory.
    pub root: PathBuf,
    /// Runtime directory for scratch state that does not survive reboots.
    pub runtime: PathBuf,
}

impl BerthPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding published images.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Published image directory for a container at a given digest.
    #[must_use]
    pub fn image(&self, container: &str, digest: &str) -> PathBuf {
        self.images().join(format!("{container}.{}", short_digest(digest)))
    }

    /// Metadata file of a published image.
    #[must_use]
    pub fn image_metadata(&self, container: &str, digest: &str) -> PathBuf {
        self.image(container, digest).join("image.json")
    }

    /// Root filesystem of a published image.
    #[must_use]
    pub fn image_root(&self, container: &str, digest: &str) -> PathBuf {
        self.image(container, digest).join("root")
    }

    /// Scratch area for images under construction.
    #[must_use]
    pub fn build_scratch(&self) -> PathBuf {
        self.images().join(".tmp")
    }

    /// Downloaded base system archives.
    #[must_use]
    pub fn rootfs_cache(&self) -> PathBuf {
        self.root.join("cache").join("rootfs")
    }

    /// Directory for persistent volumes.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Backing store of a persistent volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> PathBuf {
        self.volumes().join(name)
    }

    /// Initialization lock file of a persistent volume.
    #[must_use]
    pub fn volume_lock(&self, name: &str) -> PathBuf {
        self.volumes().join(format!(".{name}.lock"))
    }

    /// Scratch area for volumes under initialization.
    #[must_use]
    pub fn volume_scratch(&self) -> PathBuf {
        self.volumes().join(".tmp")
    }

    /// Directory for ephemeral (tmpfs) volumes.
    #[must_use]
    pub fn tmpfs(&self) -> PathBuf {
        self.runtime.join("tmpfs")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.build_scratch())?;
        std::fs::create_dir_all(self.rootfs_cache())?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.volume_scratch())?;
        std::fs::create_dir_all(self.tmpfs())?;
        Ok(())
    }
}

impl Default for BerthPaths {
    fn default() -> Self {
        Self {
            root: BERTH_ROOT.clone(),
            runtime: BERTH_RUNTIME_DIR.clone(),
        }
    }
}

/// First 16 hex characters of a `sha256:...` digest.
#[must_use]
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, h)| h);
    &hex[..hex.len().min(16)]
}

/// Join an absolute in-container path onto a host root.
#[must_use]
pub fn join_inside(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Symlinks followed while resolving one in-container path.
const MAX_SYMLINKS: usize = 40;

/// Resolve an in-container path to its host location under `root`, following
/// symlinks the way the kernel would after `chroot(root)`.
///
/// Absolute link targets and `..` are anchored at `root`, so the result never
/// leaves it. Missing components are appended as they are. With
/// `follow_last` unset a trailing symlink is returned itself.
///
/// # Errors
///
/// Returns an error on symlink loops or unreadable links.
pub fn resolve_inside(root: &Path, path: &Path, follow_last: bool) -> std::io::Result<PathBuf> {
    let mut resolved: Vec<OsString> = Vec::new();
    let mut pending: VecDeque<OsString> = VecDeque::new();
    push_components(&mut pending, &mut resolved, path);
    let mut hops = 0;

    while let Some(name) = pending.pop_front() {
        if name == ".." {
            resolved.pop();
            continue;
        }
        if pending.is_empty() && !follow_last {
            resolved.push(name);
            break;
        }
        let candidate = resolved.iter().fold(root.to_path_buf(), |p, c| p.join(c)).join(&name);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINKS {
                    return Err(std::io::Error::other(format!(
                        "too many levels of symbolic links in {}",
                        path.display()
                    )));
                }
                let target = std::fs::read_link(&candidate)?;
                let rest = std::mem::take(&mut pending);
                push_components(&mut pending, &mut resolved, &target);
                pending.extend(rest);
            }
            _ => resolved.push(name),
        }
    }
    Ok(resolved.iter().fold(root.to_path_buf(), |p, c| p.join(c)))
}

/// Queue the components of `path`; an absolute path restarts at the root.
fn push_components(pending: &mut VecDeque<OsString>, resolved: &mut Vec<OsString>, path: &Path) {
    for component in path.components() {
        match component {
            Component::RootDir => {
                pending.clear();
                resolved.clear();
            }
            Component::ParentDir => pending.push_back(OsString::from("..")),
            Component::Normal(name) => pending.push_back(name.to_os_string()),
            Component::CurDir | Component::Prefix(_) => {}
        }
    }
}
