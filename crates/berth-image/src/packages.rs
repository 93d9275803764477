//! Package resolution per distribution.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use berth_manifest::Distribution;
use once_cell::sync::Lazy;
use regex::Regex;

/// Names a package manager could plausibly accept; anything else cannot exist.
static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9+._:~@=/-]*$").expect("constant regex pattern is valid")
});

/// Alpine branch and point release of the bootstrap archive.
const ALPINE_RELEASE: (&str, &str) = ("v3.20", "3.20.3");

/// Ubuntu series and point release of the bootstrap archive.
const UBUNTU_RELEASE: (&str, &str) = ("24.04", "24.04.3");

/// A published base system archive (`.tar.gz`) for a distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsSource {
    /// Distribution the archive contains.
    pub distribution: Distribution,
    /// Download location.
    pub url: String,
    /// Expected `sha256:<hex>` digest of the archive, when pinned.
    pub sha256: Option<String>,
}

impl RootfsSource {
    /// File name the archive is cached under.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

/// Turns package names into shell scripts for one distribution.
pub trait PackageResolver: Send + Sync + std::fmt::Debug {
    /// Distribution served by this resolver.
    fn distribution(&self) -> Distribution;

    /// Base system unpacked into an empty image before its setup steps run.
    ///
    /// `None` means the image starts empty.
    fn rootfs(&self) -> Option<RootfsSource> {
        None
    }

    /// Script installing all `packages`; exits non-zero on failure.
    fn install_script(&self, packages: &[String]) -> String;

    /// Script exiting zero when `package` exists in the repositories.
    fn check_script(&self, package: &str) -> String;
}

/// Whether `name` is syntactically a package name.
#[must_use]
pub fn is_valid_package_name(name: &str) -> bool {
    PACKAGE_NAME.is_match(name)
}

/// Alpine `apk`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Apk;

impl PackageResolver for Apk {
    fn distribution(&self) -> Distribution {
        Distribution::Alpine
    }

    fn rootfs(&self) -> Option<RootfsSource> {
        let arch = match std::env::consts::ARCH {
            arch @ ("x86_64" | "aarch64") => arch,
            _ => return None,
        };
        let (branch, release) = ALPINE_RELEASE;
        Some(RootfsSource {
            distribution: Distribution::Alpine,
            url: format!(
                "https://dl-cdn.alpinelinux.org/alpine/{branch}/releases/{arch}/alpine-minirootfs-{release}-{arch}.tar.gz"
            ),
            sha256: None,
        })
    }

    fn install_script(&self, packages: &[String]) -> String {
        format!("apk add --no-cache {}", packages.join(" "))
    }

    fn check_script(&self, package: &str) -> String {
        format!("apk search --exact --quiet {package} | grep -q .")
    }
}

/// Debian and Ubuntu `apt-get`.
#[derive(Debug, Clone, Copy)]
pub struct Apt {
    distribution: Distribution,
}

impl Apt {
    /// Resolver for a Debian-family distribution.
    #[must_use]
    pub const fn new(distribution: Distribution) -> Self {
        Self { distribution }
    }
}

impl PackageResolver for Apt {
    fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Ubuntu publishes `ubuntu-base`; Debian has no plain tarball.
    fn rootfs(&self) -> Option<RootfsSource> {
        if self.distribution != Distribution::Ubuntu {
            return None;
        }
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            _ => return None,
        };
        let (series, release) = UBUNTU_RELEASE;
        Some(RootfsSource {
            distribution: Distribution::Ubuntu,
            url: format!(
                "https://cdimage.ubuntu.com/ubuntu-base/releases/{series}/release/ubuntu-base-{release}-base-{arch}.tar.gz"
            ),
            sha256: None,
        })
    }

    fn install_script(&self, packages: &[String]) -> String {
        format!(
            "apt-get update -q && DEBIAN_FRONTEND=noninteractive \
             apt-get install -y --no-install-recommends {}",
            packages.join(" ")
        )
    }

    fn check_script(&self, package: &str) -> String {
        format!("apt-cache show {package} >/dev/null 2>&1")
    }
}

/// Fedora `dnf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dnf;

impl PackageResolver for Dnf {
    fn distribution(&self) -> Distribution {
        Distribution::Fedora
    }

    fn install_script(&self, packages: &[String]) -> String {
        format!("dnf install -y --setopt=install_weak_deps=False {}", packages.join(" "))
    }

    fn check_script(&self, package: &str) -> String {
        format!("dnf -q info {package} >/dev/null 2>&1")
    }
}

/// The built-in resolvers keyed by distribution.
#[must_use]
pub fn default_resolvers() -> HashMap<Distribution, Arc<dyn PackageResolver>> {
    let resolvers: [Arc<dyn PackageResolver>; 4] = [
        Arc::new(Apk),
        Arc::new(Apt::new(Distribution::Debian)),
        Arc::new(Apt::new(Distribution::Ubuntu)),
        Arc::new(Dnf),
    ];
    resolvers
        .into_iter()
        .map(|r| (r.distribution(), r))
        .collect()
}

/// Read the distribution `ID` from `etc/os-release` under `root`.
///
/// Returns `None` without an os-release file, and `Some(Err(id))` for an
/// unrecognized id.
#[must_use]
pub fn detect_distribution(root: &Path) -> Option<Result<Distribution, String>> {
    ["etc/os-release", "usr/lib/os-release"]
        .iter()
        .find_map(|rel| std::fs::read_to_string(root.join(rel)).ok())
        .and_then(|content| {
            content
                .lines()
                .find_map(|line| line.strip_prefix("ID=").map(str::parse))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_name_every_package() {
        let pkgs = vec!["postgresql".to_string(), "curl".to_string()];
        assert_eq!(Apk.install_script(&pkgs), "apk add --no-cache postgresql curl");
        assert!(
            Apt::new(Distribution::Debian)
                .install_script(&pkgs)
                .ends_with("--no-install-recommends postgresql curl")
        );
        assert!(Dnf.check_script("curl").contains("info curl"));
    }

    #[test]
    fn rootfs_archives() {
        if !matches!(std::env::consts::ARCH, "x86_64" | "aarch64") {
            return;
        }
        let alpine = Apk.rootfs().unwrap();
        assert_eq!(alpine.distribution, Distribution::Alpine);
        assert!(alpine.file_name().starts_with("alpine-minirootfs-"));
        assert!(alpine.file_name().ends_with(".tar.gz"));

        let ubuntu = Apt::new(Distribution::Ubuntu).rootfs().unwrap();
        assert!(ubuntu.file_name().starts_with("ubuntu-base-"));
        assert!(Apt::new(Distribution::Debian).rootfs().is_none());
        assert!(Dnf.rootfs().is_none());
    }

    #[test]
    fn default_resolvers_cover_distributions() {
        let resolvers = default_resolvers();
        assert_eq!(resolvers.len(), 4);
        assert_eq!(
            resolvers[&Distribution::Ubuntu].distribution(),
            Distribution::Ubuntu
        );
    }

    #[test]
    fn package_names() {
        assert!(is_valid_package_name("libstdc++6"));
        assert!(is_valid_package_name("python3.11-dev"));
        assert!(!is_valid_package_name("curl; rm -rf /"));
        assert!(!is_valid_package_name("-y"));
        assert!(!is_valid_package_name(""));
    }

    #[test]
    fn os_release_detection() {
        let root = tempfile::tempdir().unwrap();
        assert!(detect_distribution(root.path()).is_none());

        std::fs::create_dir(root.path().join("etc")).unwrap();
        std::fs::write(
            root.path().join("etc/os-release"),
            "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.20.0\n",
        )
        .unwrap();
        assert_eq!(detect_distribution(root.path()), Some(Ok(Distribution::Alpine)));

        std::fs::write(root.path().join("etc/os-release"), "ID=\"arch\"\n").unwrap();
        assert_eq!(
            detect_distribution(root.path()),
            Some(Err("arch".to_string()))
        );
    }
}
