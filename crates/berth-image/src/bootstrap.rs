//! Base systems for images that start from a distribution.
//!
//! Archives are downloaded once into `<root>/cache/rootfs` and unpacked into
//! the build root before the first setup step.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use berth_common::{BuildError, BuildResult, RunId};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::packages::RootfsSource;

/// Downloads and unpacks base system archives.
#[derive(Debug, Clone)]
pub struct RootfsCache {
    dir: PathBuf,
    client: reqwest::Client,
}

impl RootfsCache {
    /// Cache archives under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Where `source` is cached.
    #[must_use]
    pub fn archive_path(&self, source: &RootfsSource) -> PathBuf {
        self.dir.join(source.file_name())
    }

    /// Unpack `source` into `root`, downloading it first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::BootstrapFailed`] when the download fails, the
    /// archive does not match its pinned digest or cannot be unpacked.
    pub async fn unpack_into(&self, source: &RootfsSource, root: &Path) -> BuildResult<()> {
        let archive = self.fetch(source).await?;
        verify(source, &archive)?;
        unpack(&archive, root).map_err(|e| failed(source, format!("unpack: {e}")))?;
        tracing::info!(
            distribution = %source.distribution,
            archive = %archive.display(),
            "Unpacked base system"
        );
        Ok(())
    }

    async fn fetch(&self, source: &RootfsSource) -> BuildResult<PathBuf> {
        let target = self.archive_path(source);
        if target.is_file() {
            tracing::debug!(archive = %target.display(), "Using cached base system");
            return Ok(target);
        }

        tracing::info!(url = %source.url, "Downloading base system");
        let bytes = self
            .client
            .get(&source.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| failed(source, e.to_string()))?
            .bytes()
            .await
            .map_err(|e| failed(source, e.to_string()))?;

        fs::create_dir_all(&self.dir)?;
        let partial = self
            .dir
            .join(format!(".{}.{}", source.file_name(), RunId::generate()));
        let mut file = fs::File::create(&partial)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&partial, &target)?;
        tracing::debug!(archive = %target.display(), size = bytes.len(), "Cached base system");
        Ok(target)
    }
}

fn verify(source: &RootfsSource, archive: &Path) -> BuildResult<()> {
    let Some(expected) = &source.sha256 else {
        return Ok(());
    };
    let actual = format!("sha256:{}", hex::encode(Sha256::digest(fs::read(archive)?)));
    if &actual != expected {
        return Err(failed(
            source,
            format!("digest mismatch: expected {expected}, got {actual}"),
        ));
    }
    Ok(())
}

fn unpack(archive: &Path, root: &Path) -> std::io::Result<()> {
    let file = fs::File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(rustix::process::geteuid().is_root());
    archive.set_overwrite(true);
    archive.unpack(root)
}

fn failed(source: &RootfsSource, reason: String) -> BuildError {
    BuildError::BootstrapFailed {
        distribution: source.distribution.to_string(),
        url: source.url.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use berth_manifest::Distribution;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn source(sha256: Option<String>) -> RootfsSource {
        RootfsSource {
            distribution: Distribution::Alpine,
            url: "https://example.invalid/releases/mini-rootfs.tar.gz".to_string(),
            sha256,
        }
    }

    fn seed(cache: &RootfsCache, source: &RootfsSource) -> Vec<u8> {
        let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let content = b"ID=alpine\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "etc/os-release", &content[..])
            .unwrap();
        let bytes = tar.into_inner().unwrap().finish().unwrap();

        let path = cache.archive_path(source);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, &bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn cached_archive_is_unpacked_without_download() {
        let temp = tempfile::tempdir().unwrap();
        let cache = RootfsCache::new(temp.path().join("cache"));
        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        let source = source(None);
        seed(&cache, &source);

        cache.unpack_into(&source, &root).await.unwrap();
        assert_eq!(
            fs::read_to_string(root.join("etc/os-release")).unwrap(),
            "ID=alpine\n"
        );
    }

    #[tokio::test]
    async fn pinned_digest_is_checked() {
        let temp = tempfile::tempdir().unwrap();
        let cache = RootfsCache::new(temp.path().join("cache"));
        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();

        let bytes = seed(&cache, &source(None));
        let good = source(Some(format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))));
        cache.unpack_into(&good, &root).await.unwrap();

        let bad = source(Some(format!("sha256:{}", "0".repeat(64))));
        let err = cache.unpack_into(&bad, &root).await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::BootstrapFailed { ref reason, .. } if reason.contains("mismatch")
        ));
    }

    #[test]
    fn file_name_comes_from_url() {
        assert_eq!(source(None).file_name(), "mini-rootfs.tar.gz");
    }
}
