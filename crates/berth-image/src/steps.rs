//! Filesystem setup steps.
//!
//! Steps that only touch files run in-process against the image root;
//! steps that run programs go through the launcher in [`crate::builder`].

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use berth_common::paths::resolve_inside;
use berth_common::{BuildError, BuildResult};
use berth_manifest::CopyStep;
use once_cell::sync::Lazy;
use walkdir::WalkDir;

/// File names never copied from the project directory.
const IGNORED_NAMES: &[&str] = &[".git", ".hg", ".svn", ".bzr", ".berth"];

static IGNORED_PATTERNS: Lazy<Vec<glob::Pattern>> = Lazy::new(|| {
    ["*~", "*.bak", "*.orig", "*.swp"]
        .iter()
        .map(|p| glob::Pattern::new(p).expect("constant glob pattern is valid"))
        .collect()
});

/// Whether a project file is skipped by `!Copy`.
#[must_use]
pub fn is_ignored(name: &str) -> bool {
    IGNORED_NAMES.contains(&name) || IGNORED_PATTERNS.iter().any(|p| p.matches(name))
}

/// Resolve an absolute in-image path to its location under `root`.
///
/// Symlinks in the image are followed relative to `root`, the last component
/// only when `follow_last` is set.
///
/// # Errors
///
/// Returns [`BuildError::InvalidPath`] for relative paths, `..` components
/// or the root itself.
pub fn inside(root: &Path, path: &Path, follow_last: bool) -> BuildResult<PathBuf> {
    let valid = path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(BuildError::InvalidPath {
            path: path.display().to_string(),
        });
    }
    Ok(resolve_inside(root, path, follow_last)?)
}

/// `!EnsureDir`: create a directory and its parents.
///
/// # Errors
///
/// Returns [`BuildError::PathConflict`] when a non-directory is in the way.
pub fn ensure_dir(root: &Path, path: &Path) -> BuildResult<()> {
    let target = inside(root, path, true)?;
    for ancestor in target.ancestors().take_while(|a| a.starts_with(root) && *a != root) {
        if let Ok(meta) = fs::symlink_metadata(ancestor) {
            if !meta.is_dir() {
                return Err(BuildError::PathConflict {
                    path: path.to_path_buf(),
                    reason: format!(
                        "{} exists and is not a directory",
                        ancestor.strip_prefix(root).unwrap_or(ancestor).display()
                    ),
                });
            }
        }
    }
    fs::create_dir_all(&target)?;
    Ok(())
}

/// `!Remove`: delete a file or directory tree. Missing paths are fine.
///
/// # Errors
///
/// Returns an error for invalid paths or failed removal.
pub fn remove_path(root: &Path, path: &Path) -> BuildResult<()> {
    let target = inside(root, path, false)?;
    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
        Ok(_) => fs::remove_file(&target)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// How entries are created by [`copy_tree`].
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Bits cleared from source permissions.
    pub umask: u32,
    /// Owner of created entries; `None` keeps the source owner.
    pub owner: (Option<u32>, Option<u32>),
    /// Skip VCS and backup files.
    pub skip_ignored: bool,
}

impl CopyOptions {
    /// Exact replica: full modes, source ownership, nothing skipped.
    #[must_use]
    pub const fn replica() -> Self {
        Self {
            umask: 0,
            owner: (None, None),
            skip_ignored: false,
        }
    }
}

/// `!Copy`: copy a project file or directory into the image.
///
/// # Errors
///
/// Returns an error when the source is missing or copying fails.
pub fn copy(root: &Path, base_dir: &Path, step: &CopyStep) -> BuildResult<u64> {
    let source = base_dir.join(&step.source);
    if !source.exists() {
        return Err(BuildError::InvalidPath {
            path: source.display().to_string(),
        });
    }
    let target = inside(root, &step.path, true)?;
    let options = CopyOptions {
        umask: step.umask.bits(),
        owner: (step.owner_uid, step.owner_gid),
        skip_ignored: true,
    };
    copy_tree(&source, &target, options)
}

/// Copy `source` (file or directory) to `target`, returning the entry count.
///
/// # Errors
///
/// Returns an error if reading or writing any entry fails.
pub fn copy_tree(source: &Path, target: &Path, options: CopyOptions) -> BuildResult<u64> {
    let chown = rustix::process::geteuid().is_root();
    let mut copied = 0;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !options.skip_ignored
                || !e.file_name().to_str().is_some_and(is_ignored)
        });

    for entry in walker {
        let entry = entry.map_err(|e| BuildError::Io(e.into()))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let dest = if rel.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(rel)
        };
        let meta = entry.path().symlink_metadata()?;
        let mode = meta.mode() & 0o7777 & !options.umask;
        let file_type = meta.file_type();

        let existing = fs::symlink_metadata(&dest).ok();
        if existing.as_ref().is_some_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&dest)?;
        }

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if existing.is_some_and(|m| m.is_file()) {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(link, &dest)?;
        } else if file_type.is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        }

        if chown {
            let uid = options.owner.0.unwrap_or_else(|| meta.uid());
            let gid = options.owner.1.unwrap_or_else(|| meta.gid());
            std::os::unix::fs::lchown(&dest, Some(uid), Some(gid))?;
        }
        copied += 1;
    }
    Ok(copied)
}

/// Total size in bytes of regular files under `root`.
#[must_use]
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use berth_manifest::FileMode;

    use super::*;

    #[test]
    fn inside_rejects_escapes() {
        let root = Path::new("/img");
        assert_eq!(
            inside(root, Path::new("/var/lib"), true).unwrap(),
            PathBuf::from("/img/var/lib")
        );
        assert!(inside(root, Path::new("var/lib"), true).is_err());
        assert!(inside(root, Path::new("/var/../etc"), true).is_err());
        assert!(inside(root, Path::new("/"), true).is_err());
    }

    #[test]
    fn ensure_dir_and_conflict() {
        let root = tempfile::tempdir().unwrap();
        ensure_dir(root.path(), Path::new("/var/lib/data")).unwrap();
        assert!(root.path().join("var/lib/data").is_dir());
        ensure_dir(root.path(), Path::new("/var/lib/data")).unwrap();

        fs::write(root.path().join("var/file"), "x").unwrap();
        let err = ensure_dir(root.path(), Path::new("/var/file/sub")).unwrap_err();
        assert!(matches!(err, BuildError::PathConflict { .. }));
    }

    #[test]
    fn absolute_symlinks_do_not_reach_the_host() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("victim"), "keep").unwrap();
        fs::create_dir(root.path().join("var")).unwrap();
        std::os::unix::fs::symlink(host.path(), root.path().join("var/run")).unwrap();

        remove_path(root.path(), Path::new("/var/run/victim")).unwrap();
        assert!(host.path().join("victim").exists());

        ensure_dir(root.path(), Path::new("/var/run/app")).unwrap();
        assert!(!host.path().join("app").exists());
        let anchored = root.path().join(host.path().strip_prefix("/").unwrap());
        assert!(anchored.join("app").is_dir());

        remove_path(root.path(), Path::new("/var/run")).unwrap();
        assert!(fs::symlink_metadata(root.path().join("var/run")).is_err());
        assert!(host.path().join("victim").exists());
    }

    #[test]
    fn relative_usrmerge_links_are_followed() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("usr/bin", root.path().join("bin")).unwrap();

        ensure_dir(root.path(), Path::new("/bin/tools")).unwrap();
        assert!(root.path().join("usr/bin/tools").is_dir());
    }

    #[test]
    fn copy_replaces_symlinks_instead_of_writing_through() {
        let project = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        fs::create_dir(project.path().join("conf")).unwrap();
        fs::write(project.path().join("conf/app.yaml"), "new").unwrap();
        fs::create_dir_all(root.path().join("etc/app")).unwrap();
        std::os::unix::fs::symlink(
            host.path().join("app.yaml"),
            root.path().join("etc/app/app.yaml"),
        )
        .unwrap();

        let step = CopyStep {
            source: PathBuf::from("conf"),
            path: PathBuf::from("/etc/app"),
            owner_uid: None,
            owner_gid: None,
            umask: FileMode(0o022),
        };
        copy(root.path(), project.path(), &step).unwrap();

        assert!(!host.path().join("app.yaml").exists());
        assert_eq!(
            fs::read_to_string(root.path().join("etc/app/app.yaml")).unwrap(),
            "new"
        );
    }

    #[test]
    fn remove_tolerates_missing() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("var/cache/apk")).unwrap();
        fs::write(root.path().join("var/cache/apk/index"), "x").unwrap();

        remove_path(root.path(), Path::new("/var/cache/apk")).unwrap();
        assert!(!root.path().join("var/cache/apk").exists());
        remove_path(root.path(), Path::new("/var/cache/apk")).unwrap();
    }

    #[test]
    fn copy_skips_vcs_and_applies_umask() {
        let project = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = project.path().join("conf");
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::write(src.join(".git/HEAD"), "ref").unwrap();
        fs::write(src.join("app.yaml"), "port: 80").unwrap();
        fs::write(src.join("app.yaml~"), "old").unwrap();
        fs::write(src.join("app.yaml.bak"), "old").unwrap();
        fs::set_permissions(src.join("app.yaml"), fs::Permissions::from_mode(0o666)).unwrap();

        let step = CopyStep {
            source: PathBuf::from("conf"),
            path: PathBuf::from("/etc/app"),
            owner_uid: None,
            owner_gid: None,
            umask: FileMode(0o022),
        };
        copy(root.path(), project.path(), &step).unwrap();

        let dest = root.path().join("etc/app");
        assert_eq!(fs::read_to_string(dest.join("app.yaml")).unwrap(), "port: 80");
        assert!(!dest.join(".git").exists());
        assert!(!dest.join("app.yaml~").exists());
        assert!(!dest.join("app.yaml.bak").exists());
        let mode = fs::metadata(dest.join("app.yaml")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn copy_missing_source() {
        let root = tempfile::tempdir().unwrap();
        let step = CopyStep {
            source: PathBuf::from("nope"),
            path: PathBuf::from("/x"),
            owner_uid: None,
            owner_gid: None,
            umask: FileMode(0o002),
        };
        assert!(matches!(
            copy(root.path(), root.path(), &step),
            Err(BuildError::InvalidPath { .. })
        ));
    }

    #[test]
    fn replica_keeps_symlinks_and_dotfiles() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join(".git")).unwrap();
        std::os::unix::fs::symlink("/bin/busybox", src.path().join("sh")).unwrap();

        let target = dst.path().join("root");
        copy_tree(src.path(), &target, CopyOptions::replica()).unwrap();
        assert!(target.join(".git").is_dir());
        assert_eq!(
            fs::read_link(target.join("sh")).unwrap(),
            PathBuf::from("/bin/busybox")
        );
    }

    #[test]
    fn ignore_rules() {
        assert!(is_ignored(".git"));
        assert!(is_ignored("notes.orig"));
        assert!(is_ignored("main.rs~"));
        assert!(!is_ignored("gitignore"));
        assert!(!is_ignored("Cargo.toml"));
    }
}
