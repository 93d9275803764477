//! Content digests of container definitions.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use berth_common::BuildResult;
use berth_manifest::{ContainerSpec, SetupStep};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::packages::RootfsSource;
use crate::steps::is_ignored;

/// Bumped whenever the on-disk image layout changes.
const FORMAT: &str = "berth-image-v1";

/// Digest of everything that determines a container's image.
///
/// Covers the setup steps, distribution, volume mount points (pre-created
/// in the image), the parent image digest or base system archive and the
/// content of `!Copy` sources. The container's environment is not part of the image.
///
/// # Errors
///
/// Returns an error if a `!Copy` source cannot be read.
pub fn image_digest(
    spec: &ContainerSpec,
    parent: Option<&str>,
    rootfs: Option<&RootfsSource>,
    base_dir: &Path,
) -> BuildResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(FORMAT.as_bytes());

    if let Some(parent) = parent {
        hasher.update(b"parent\0");
        hasher.update(parent.as_bytes());
    }
    if let Some(rootfs) = rootfs {
        hasher.update(b"rootfs\0");
        hasher.update(rootfs.url.as_bytes());
        if let Some(sha256) = &rootfs.sha256 {
            hasher.update(sha256.as_bytes());
        }
    }
    if let Some(distribution) = spec.distribution {
        hasher.update(b"distribution\0");
        hasher.update(distribution.to_string().as_bytes());
    }

    let steps = serde_json::to_vec(&spec.setup).map_err(std::io::Error::other)?;
    hasher.update(b"steps\0");
    hasher.update(&steps);

    for mount_point in spec.volumes.keys() {
        hasher.update(b"volume\0");
        hasher.update(mount_point.as_os_str().as_encoded_bytes());
    }

    for step in &spec.setup {
        if let SetupStep::Copy(copy) = step {
            hash_source(&mut hasher, &base_dir.join(&copy.source))?;
        }
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn hash_source(hasher: &mut Sha256, source: &Path) -> BuildResult<()> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_str().is_some_and(is_ignored));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // A missing source fails the step itself; the digest just records it.
            Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                hasher.update(b"missing\0");
                continue;
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        };
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let meta = entry.path().symlink_metadata()?;
        hasher.update(b"entry\0");
        hasher.update(rel.as_os_str().as_encoded_bytes());
        hasher.update(meta.mode().to_le_bytes());
        if meta.file_type().is_file() {
            hasher.update(fs::read(entry.path())?);
        } else if meta.file_type().is_symlink() {
            hasher.update(fs::read_link(entry.path())?.as_os_str().as_encoded_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use berth_manifest::{CopyStep, FileMode};

    use super::*;

    fn spec(steps: Vec<SetupStep>) -> ContainerSpec {
        ContainerSpec {
            setup: steps,
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn stable_and_step_sensitive() {
        let base = Path::new("/nonexistent");
        let a = spec(vec![SetupStep::RunShell("echo a".to_string())]);
        let b = spec(vec![SetupStep::RunShell("echo b".to_string())]);

        let digest = image_digest(&a, None, None, base).unwrap();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
        assert_eq!(digest, image_digest(&a, None, None, base).unwrap());
        assert_ne!(digest, image_digest(&b, None, None, base).unwrap());
        assert_ne!(digest, image_digest(&a, Some("sha256:00"), None, base).unwrap());
    }

    #[test]
    fn base_system_archive_matters() {
        let base = Path::new("/nonexistent");
        let a = spec(vec![SetupStep::EnsureDir(PathBuf::from("/srv"))]);
        let rootfs = |url: &str| RootfsSource {
            distribution: berth_manifest::Distribution::Alpine,
            url: url.to_string(),
            sha256: None,
        };
        let v1 = rootfs("https://mirror/alpine-minirootfs-3.20.0.tar.gz");
        let v2 = rootfs("https://mirror/alpine-minirootfs-3.20.3.tar.gz");

        let empty = image_digest(&a, None, None, base).unwrap();
        let first = image_digest(&a, None, Some(&v1), base).unwrap();
        assert_ne!(empty, first);
        assert_ne!(first, image_digest(&a, None, Some(&v2), base).unwrap());
    }

    #[test]
    fn environment_does_not_matter() {
        let base = Path::new("/nonexistent");
        let mut a = spec(vec![SetupStep::EnsureDir(PathBuf::from("/data"))]);
        let before = image_digest(&a, None, None, base).unwrap();
        a.environ.insert("DEBUG".to_string(), "1".to_string());
        assert_eq!(before, image_digest(&a, None, None, base).unwrap());
    }

    #[test]
    fn copy_source_content_matters() {
        let project = tempfile::tempdir().unwrap();
        fs::create_dir(project.path().join("conf")).unwrap();
        fs::write(project.path().join("conf/app.yaml"), "a").unwrap();
        let c = spec(vec![SetupStep::Copy(CopyStep {
            source: PathBuf::from("conf"),
            path: PathBuf::from("/etc/app"),
            owner_uid: None,
            owner_gid: None,
            umask: FileMode(0o002),
        })]);

        let first = image_digest(&c, None, None, project.path()).unwrap();
        fs::write(project.path().join("conf/app.yaml.bak"), "ignored").unwrap();
        assert_eq!(first, image_digest(&c, None, None, project.path()).unwrap());
        fs::write(project.path().join("conf/app.yaml"), "b").unwrap();
        assert_ne!(first, image_digest(&c, None, None, project.path()).unwrap());
    }
}
