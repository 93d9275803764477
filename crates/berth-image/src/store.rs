//! Published images on disk.
//!
//! Layout under `<root>/images`:
//!
//! ```text
//! <container>.<digest16>/image.json   metadata
//! <container>.<digest16>/root/        filesystem
//! .tmp/<run-id>/                      builds in progress
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use berth_common::paths::short_digest;
use berth_common::{BerthPaths, BuildResult, RunId};
use berth_manifest::Distribution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const METADATA_FILE: &str = "image.json";
const ROOT_DIR: &str = "root";

/// An immutable, published container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    /// Container name.
    pub container: String,
    /// Content digest (`sha256:...`).
    pub digest: String,
    /// Digest of the inherited image, if any.
    #[serde(default)]
    pub parent: Option<String>,
    /// Distribution used to resolve packages, if known.
    #[serde(default)]
    pub distribution: Option<Distribution>,
    /// Build completion time.
    pub created: DateTime<Utc>,
    /// Total size of regular files in bytes.
    pub size: u64,
    /// Filesystem root of the image.
    #[serde(skip)]
    pub root: PathBuf,
}

impl BuiltImage {
    /// Short digest used in directory names and listings.
    #[must_use]
    pub fn short_digest(&self) -> &str {
        short_digest(&self.digest)
    }
}

/// Reads and publishes images.
#[derive(Debug, Clone)]
pub struct ImageStore {
    paths: BerthPaths,
}

impl ImageStore {
    /// Create a store over `paths`.
    #[must_use]
    pub const fn new(paths: BerthPaths) -> Self {
        Self { paths }
    }

    /// The published image of `container` with `digest`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata exists but cannot be read.
    pub fn lookup(&self, container: &str, digest: &str) -> BuildResult<Option<BuiltImage>> {
        let dir = self.paths.image(container, digest);
        let image = Self::load(&dir)?;
        Ok(image.filter(|image| image.container == container && image.digest == digest))
    }

    fn load(dir: &Path) -> BuildResult<Option<BuiltImage>> {
        let content = match fs::read(dir.join(METADATA_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut image: BuiltImage = match serde_json::from_slice(&content) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Ignoring unreadable image metadata");
                return Ok(None);
            }
        };
        image.root = dir.join(ROOT_DIR);
        Ok(Some(image))
    }

    /// Every published image, sorted by container then age.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be listed.
    pub fn list(&self) -> BuildResult<Vec<BuiltImage>> {
        let entries = match fs::read_dir(self.paths.images()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Some(image) = Self::load(&entry.path())? {
                images.push(image);
            }
        }
        images.sort_by(|a, b| {
            a.container
                .cmp(&b.container)
                .then_with(|| a.created.cmp(&b.created))
        });
        Ok(images)
    }

    /// Allocate an empty scratch directory for a build, with an empty `root/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn scratch(&self) -> BuildResult<Scratch> {
        let dir = self.paths.build_scratch().join(RunId::generate().as_str());
        fs::create_dir_all(dir.join(ROOT_DIR))?;
        Ok(Scratch { dir: Some(dir) })
    }

    /// Atomically publish a finished build.
    ///
    /// If an identical image was published concurrently, the existing one wins.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be written or the rename fails.
    pub fn publish(&self, mut scratch: Scratch, image: &BuiltImage) -> BuildResult<BuiltImage> {
        let Some(dir) = scratch.dir.take() else {
            return Err(std::io::Error::other("scratch directory already consumed").into());
        };
        let metadata = serde_json::to_vec_pretty(image).map_err(std::io::Error::other)?;
        fs::write(dir.join(METADATA_FILE), metadata)?;

        let target = self.paths.image(&image.container, &image.digest);
        if let Err(e) = fs::rename(&dir, &target) {
            if target.join(METADATA_FILE).exists() {
                tracing::debug!(container = %image.container, "Image already published");
                remove_tree(&dir);
            } else {
                remove_tree(&dir);
                return Err(e.into());
            }
        }

        tracing::info!(
            container = %image.container,
            digest = %image.short_digest(),
            size = image.size,
            "Published image"
        );
        Ok(BuiltImage {
            root: target.join(ROOT_DIR),
            ..image.clone()
        })
    }

    /// Remove every image of `container` except the one with `keep` digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be listed.
    pub fn prune(&self, container: &str, keep: &str) -> BuildResult<usize> {
        let keep_dir = self.paths.image(container, keep);
        let mut removed = 0;
        for image in self.list()? {
            if image.container != container {
                continue;
            }
            let Some(dir) = image.root.parent() else {
                continue;
            };
            if dir == keep_dir {
                continue;
            }
            tracing::debug!(container, digest = %image.short_digest(), "Pruning old image");
            fs::remove_dir_all(dir)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// A build directory that is deleted unless published.
#[derive(Debug)]
pub struct Scratch {
    dir: Option<PathBuf>,
}

impl Scratch {
    /// Filesystem root being built.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.dir
            .as_deref()
            .map(|d| d.join(ROOT_DIR))
            .unwrap_or_default()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            tracing::debug!(path = %dir.display(), "Discarding unpublished build");
            remove_tree(&dir);
        }
    }
}

fn remove_tree(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        tracing::warn!(path = %dir.display(), error = %e, "Failed to remove build directory");
    }
}
