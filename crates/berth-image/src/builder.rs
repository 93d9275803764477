//! Image builder.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use berth_common::paths::short_digest;
use berth_common::{BerthPaths, BuildError, BuildResult};
use berth_manifest::environ::{self, Environ};
use berth_manifest::{ContainerSpec, Distribution, Manifest, SetupStep};
use berth_sandbox::{LaunchSpec, Launcher, Mount, ProcessExit};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::bootstrap::RootfsCache;
use crate::digest::image_digest;
use crate::packages::{self, PackageResolver, RootfsSource};
use crate::steps::{self, CopyOptions};
use crate::store::{BuiltImage, ImageStore, Scratch};
use crate::users;

/// Mount point of the project directory inside containers.
pub const PROJECT_MOUNT: &str = "/work";

/// Builds container images from manifest setup steps.
///
/// Builds of the same container are serialized; different containers build
/// concurrently.
#[derive(Debug)]
pub struct Builder {
    store: ImageStore,
    launcher: Arc<dyn Launcher>,
    resolvers: HashMap<Distribution, Arc<dyn PackageResolver>>,
    rootfs: RootfsCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// State shared by the steps of one build.
struct StepContext<'a> {
    manifest: &'a Manifest,
    container: &'a str,
    root: &'a Path,
    env: Environ,
}

impl Builder {
    /// Create a builder storing images under `paths`.
    #[must_use]
    pub fn new(paths: BerthPaths, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            rootfs: RootfsCache::new(paths.rootfs_cache()),
            store: ImageStore::new(paths),
            launcher,
            resolvers: packages::default_resolvers(),
            locks: DashMap::new(),
        }
    }

    /// Replace the resolver for its distribution.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn PackageResolver>) -> Self {
        self.resolvers.insert(resolver.distribution(), resolver);
        self
    }

    /// The image store.
    #[must_use]
    pub const fn store(&self) -> &ImageStore {
        &self.store
    }

    /// The launcher used for setup scripts.
    #[must_use]
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        Arc::clone(&self.launcher)
    }

    /// Digest the image of `name` would have, without building anything.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown containers or unreadable `!Copy` sources.
    pub fn digest(&self, manifest: &Manifest, name: &str) -> BuildResult<String> {
        let mut parent: Option<String> = None;
        for container in inheritance_chain(manifest, name)? {
            let spec = container_spec(manifest, container)?;
            let rootfs = self.rootfs_source(spec);
            parent = Some(image_digest(
                spec,
                parent.as_deref(),
                rootfs.as_ref(),
                &manifest.base_dir,
            )?);
        }
        parent.ok_or_else(|| BuildError::ContainerNotFound {
            name: name.to_string(),
        })
    }

    /// The published image of `name`, if it is up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest cannot be computed.
    pub fn cached(&self, manifest: &Manifest, name: &str) -> BuildResult<Option<BuiltImage>> {
        let digest = self.digest(manifest, name)?;
        self.store.lookup(name, &digest)
    }

    /// Remove every image version the manifest no longer produces, keeping
    /// the current version of each declared container. Returns how many
    /// were removed.
    ///
    /// Images of containers missing from the manifest are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if a digest cannot be computed or a removal fails.
    pub async fn clean_old(&self, manifest: &Manifest) -> BuildResult<usize> {
        let mut removed = 0;
        for name in manifest.containers.keys() {
            let current = self.digest(manifest, name)?;
            let lock = self.locks.entry(name.clone()).or_default().clone();
            let _guard = lock.lock().await;
            let count = self.store.prune(name, &current)?;
            if count > 0 {
                tracing::info!(container = %name, removed = count, "Removed old images");
            }
            removed += count;
        }
        Ok(removed)
    }

    /// Build the image of `name`, or reuse the cached one.
    ///
    /// Inherited containers are built first.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; nothing is published then.
    pub async fn build(&self, manifest: &Manifest, name: &str) -> BuildResult<Arc<BuiltImage>> {
        let mut image: Option<Arc<BuiltImage>> = None;
        for container in inheritance_chain(manifest, name)? {
            image = Some(self.build_one(manifest, container, image.as_deref()).await?);
        }
        image.ok_or_else(|| BuildError::ContainerNotFound {
            name: name.to_string(),
        })
    }

    async fn build_one(
        &self,
        manifest: &Manifest,
        name: &str,
        parent: Option<&BuiltImage>,
    ) -> BuildResult<Arc<BuiltImage>> {
        let spec = container_spec(manifest, name)?;
        let rootfs = self.rootfs_source(spec);
        let digest = image_digest(
            spec,
            parent.map(|p| p.digest.as_str()),
            rootfs.as_ref(),
            &manifest.base_dir,
        )?;

        let lock = self.locks.entry(name.to_string()).or_default().clone();
        let _guard = lock.lock().await;

        if let Some(image) = self.store.lookup(name, &digest)? {
            tracing::debug!(container = name, digest = short_digest(&digest), "Using cached image");
            return Ok(Arc::new(image));
        }

        tracing::info!(
            container = name,
            digest = short_digest(&digest),
            steps = spec.setup.len(),
            "Building image"
        );

        let scratch = self.store.scratch()?;
        if let Some(source) = &rootfs {
            tracing::info!(
                container = name,
                distribution = %source.distribution,
                "Bootstrapping base system"
            );
            self.rootfs.unpack_into(source, &scratch.root()).await?;
        }
        let distribution = self.run_steps(manifest, name, spec, parent, &scratch).await?;

        let root = scratch.root();
        steps::ensure_dir(&root, Path::new(PROJECT_MOUNT))?;
        for mount_point in spec.volumes.keys() {
            steps::ensure_dir(&root, mount_point)?;
        }

        let image = BuiltImage {
            container: name.to_string(),
            digest,
            parent: parent.map(|p| p.digest.clone()),
            distribution,
            created: Utc::now(),
            size: steps::tree_size(&root),
            root,
        };
        let published = self.store.publish(scratch, &image)?;
        Ok(Arc::new(published))
    }

    /// Base system for a container that declares a distribution and does not
    /// inherit another image.
    fn rootfs_source(&self, spec: &ContainerSpec) -> Option<RootfsSource> {
        if spec.parent().is_some() {
            return None;
        }
        self.resolvers.get(&spec.distribution?)?.rootfs()
    }

    /// Replay the setup steps in order; returns the distribution in effect.
    async fn run_steps(
        &self,
        manifest: &Manifest,
        name: &str,
        spec: &ContainerSpec,
        parent: Option<&BuiltImage>,
        scratch: &Scratch,
    ) -> BuildResult<Option<Distribution>> {
        let root = scratch.root();
        let ctx = StepContext {
            manifest,
            container: name,
            root: &root,
            env: environ::resolve(&spec.environ, &Environ::new(), &[]),
        };
        let mut distribution = spec
            .distribution
            .or_else(|| parent.and_then(|p| p.distribution));

        for (index, step) in spec.setup.iter().enumerate() {
            let number = index + 1;
            tracing::info!(container = name, step = number, kind = step.kind(), "Running setup step");

            match step {
                SetupStep::Inherit(base) => {
                    let parent = parent.ok_or_else(|| BuildError::ContainerNotFound {
                        name: base.clone(),
                    })?;
                    let entries = steps::copy_tree(&parent.root, &root, CopyOptions::replica())?;
                    tracing::debug!(container = name, base = %base, entries, "Copied base image");
                }
                SetupStep::InstallPackages(packages) => {
                    distribution = Some(self.install(&ctx, number, packages, distribution).await?);
                }
                SetupStep::RunShell(script) => {
                    let exit = self.run_script(&ctx, number, script).await?;
                    if !exit.success() {
                        return Err(step_failed(&ctx, number, exit));
                    }
                }
                SetupStep::EnsureDir(path) => steps::ensure_dir(&root, path)?,
                SetupStep::RemovePath(path) => steps::remove_path(&root, path)?,
                SetupStep::CreateUser(user) => users::create_user(&root, user)?,
                SetupStep::Copy(copy) => {
                    let entries = steps::copy(&root, &manifest.base_dir, copy)?;
                    tracing::debug!(container = name, path = %copy.path.display(), entries, "Copied files");
                }
            }
        }
        Ok(distribution)
    }

    async fn install(
        &self,
        ctx: &StepContext<'_>,
        step: usize,
        packages: &[String],
        declared: Option<Distribution>,
    ) -> BuildResult<Distribution> {
        let distribution = match declared {
            Some(distribution) => distribution,
            None => match packages::detect_distribution(ctx.root) {
                Some(Ok(distribution)) => distribution,
                Some(Err(id)) => return Err(unknown_distribution(ctx, id)),
                None => return Err(unknown_distribution(ctx, "unknown".to_string())),
            },
        };
        let resolver = self
            .resolvers
            .get(&distribution)
            .ok_or_else(|| unknown_distribution(ctx, distribution.to_string()))?;

        if packages.is_empty() {
            return Ok(distribution);
        }
        if let Some(bad) = packages.iter().find(|p| !packages::is_valid_package_name(p)) {
            return Err(BuildError::PackageNotFound {
                package: bad.clone(),
                distribution: distribution.to_string(),
            });
        }

        tracing::info!(container = ctx.container, %distribution, ?packages, "Installing packages");
        let exit = self
            .run_script(ctx, step, &resolver.install_script(packages))
            .await?;
        if exit.success() {
            return Ok(distribution);
        }

        for package in packages {
            let found = self
                .run_script(ctx, step, &resolver.check_script(package))
                .await?;
            if !found.success() {
                return Err(BuildError::PackageNotFound {
                    package: package.clone(),
                    distribution: distribution.to_string(),
                });
            }
        }
        Err(step_failed(ctx, step, exit))
    }

    async fn run_script(
        &self,
        ctx: &StepContext<'_>,
        step: usize,
        script: &str,
    ) -> BuildResult<ProcessExit> {
        copy_resolv_conf(ctx.root);

        let mut spec = LaunchSpec::new(
            ctx.root,
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        )
        .env(ctx.env.clone());
        if ctx.manifest.base_dir.is_dir() {
            spec = spec.mount(Mount::bind(&ctx.manifest.base_dir, PROJECT_MOUNT));
        }

        let launch = |source| BuildError::Launch { step, source };
        let mut process = self.launcher.spawn(&spec).map_err(launch)?;
        let exit = process.wait().await.map_err(launch)?;
        tracing::debug!(container = ctx.container, step, %exit, "Setup script finished");
        Ok(exit)
    }
}

/// Containers to build for `name`, base first.
fn inheritance_chain<'a>(manifest: &'a Manifest, name: &'a str) -> BuildResult<Vec<&'a str>> {
    let mut chain = vec![name];
    let mut seen = BTreeSet::from([name]);
    let mut current = container_spec(manifest, name)?;
    while let Some(parent) = current.parent() {
        if !seen.insert(parent) {
            return Err(BuildError::InvalidPath {
                path: format!("circular !Container chain at {parent}"),
            });
        }
        chain.push(parent);
        current = container_spec(manifest, parent)?;
    }
    chain.reverse();
    Ok(chain)
}

fn container_spec<'a>(manifest: &'a Manifest, name: &str) -> BuildResult<&'a ContainerSpec> {
    manifest
        .containers
        .get(name)
        .ok_or_else(|| BuildError::ContainerNotFound {
            name: name.to_string(),
        })
}

fn step_failed(ctx: &StepContext<'_>, step: usize, exit: ProcessExit) -> BuildError {
    BuildError::ShellStepFailed {
        container: ctx.container.to_string(),
        step,
        exit_code: exit.code(),
    }
}

fn unknown_distribution(ctx: &StepContext<'_>, distribution: String) -> BuildError {
    BuildError::UnknownDistribution {
        container: ctx.container.to_string(),
        distribution,
    }
}

/// Give setup scripts the host's DNS configuration.
fn copy_resolv_conf(root: &Path) {
    let etc = root.join("etc");
    if !etc.is_dir() {
        return;
    }
    if let Err(e) = std::fs::copy("/etc/resolv.conf", etc.join("resolv.conf")) {
        tracing::debug!(error = %e, "Not copying resolv.conf");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_base_first() {
        let yaml = r"
containers:
  base: {}
  mid: { setup: [!Container base] }
  top: { setup: [!Container mid, !EnsureDir /x] }
";
        let manifest = Manifest::from_yaml(yaml, "/").unwrap();
        assert_eq!(
            inheritance_chain(&manifest, "top").unwrap(),
            vec!["base", "mid", "top"]
        );
        assert!(matches!(
            inheritance_chain(&manifest, "nope"),
            Err(BuildError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn digest_follows_parent_changes() {
        let paths = BerthPaths::with_root("/nonexistent");
        let builder = Builder::new(paths, Arc::new(berth_sandbox::HostLauncher::new()));
        let a = Manifest::from_yaml(
            "containers:\n  base: { setup: [!Sh 'echo 1'] }\n  app: { setup: [!Container base] }\n",
            "/",
        )
        .unwrap();
        let b = Manifest::from_yaml(
            "containers:\n  base: { setup: [!Sh 'echo 2'] }\n  app: { setup: [!Container base] }\n",
            "/",
        )
        .unwrap();
        assert_ne!(
            builder.digest(&a, "app").unwrap(),
            builder.digest(&b, "app").unwrap()
        );
    }
}
