//! Container definitions and setup steps.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::mode::FileMode;
use crate::volume::VolumeSpec;

/// A container: ordered setup steps, default environment and volumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ContainerSpec {
    /// Human readable description shown by `berth list --containers`.
    #[serde(default)]
    pub description: Option<String>,

    /// Distribution identity used to resolve packages.
    #[serde(default)]
    pub distribution: Option<Distribution>,

    /// Setup steps, replayed strictly in order.
    #[serde(default)]
    pub setup: Vec<SetupStep>,

    /// Default environment of every process run in this container.
    #[serde(default)]
    pub environ: BTreeMap<String, String>,

    /// Volumes keyed by absolute mount point.
    #[serde(default)]
    pub volumes: BTreeMap<PathBuf, VolumeSpec>,
}

impl ContainerSpec {
    /// Container this one is built on top of, if its first step inherits.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        match self.setup.first() {
            Some(SetupStep::Inherit(name)) => Some(name),
            _ => None,
        }
    }
}

/// One setup step.
///
/// In YAML every step is a tagged value, e.g. `!Install [postgresql]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupStep {
    /// Start from the image of another container. Only valid as the first step.
    #[serde(rename = "Container")]
    Inherit(String),

    /// Install packages through the distribution's package manager.
    #[serde(rename = "Install")]
    InstallPackages(Vec<String>),

    /// Run a shell script inside the image root.
    #[serde(rename = "Sh")]
    RunShell(String),

    /// Create a directory (and its parents).
    EnsureDir(PathBuf),

    /// Remove a file or directory tree; missing paths are fine.
    #[serde(rename = "Remove")]
    RemovePath(PathBuf),

    /// Add a user with fixed ids.
    CreateUser(UserStep),

    /// Copy files from the project directory into the image.
    Copy(CopyStep),
}

impl SetupStep {
    /// Short step name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Inherit(_) => "Container",
            Self::InstallPackages(_) => "Install",
            Self::RunShell(_) => "Sh",
            Self::EnsureDir(_) => "EnsureDir",
            Self::RemovePath(_) => "Remove",
            Self::CreateUser(_) => "CreateUser",
            Self::Copy(_) => "Copy",
        }
    }
}

/// A user to add to `/etc/passwd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UserStep {
    /// Login name.
    pub name: String,
    /// Fixed numeric user id.
    pub uid: u32,
    /// Fixed numeric primary group id.
    pub gid: u32,
    /// Primary group name; defaults to the user name.
    #[serde(default)]
    pub group: Option<String>,
    /// Home directory; defaults to `/home/<name>`.
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Login shell.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl UserStep {
    /// Primary group name.
    #[must_use]
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    /// Home directory.
    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        self.home
            .clone()
            .unwrap_or_else(|| PathBuf::from("/home").join(&self.name))
    }
}

/// Copy a file or directory from the project into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CopyStep {
    /// Source path, relative to the manifest directory.
    pub source: PathBuf,
    /// Absolute destination path inside the image.
    pub path: PathBuf,
    /// Owner uid of copied entries.
    #[serde(default)]
    pub owner_uid: Option<u32>,
    /// Owner gid of copied entries.
    #[serde(default)]
    pub owner_gid: Option<u32>,
    /// Umask applied to created entries.
    #[serde(default = "default_umask")]
    pub umask: FileMode,
}

const fn default_umask() -> FileMode {
    FileMode(0o002)
}

/// Distributions with a known package resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Alpine Linux (apk).
    Alpine,
    /// Debian (apt).
    Debian,
    /// Ubuntu (apt).
    Ubuntu,
    /// Fedora (dnf).
    Fedora,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Alpine => "alpine",
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Fedora => "fedora",
        };
        f.write_str(name)
    }
}

impl FromStr for Distribution {
    type Err = String;

    /// Parse an `ID=` value from `os-release`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "alpine" => Ok(Self::Alpine),
            "debian" => Ok(Self::Debian),
            "ubuntu" => Ok(Self::Ubuntu),
            "fedora" => Ok(Self::Fedora),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tagged_steps() {
        let yaml = r"
distribution: alpine
setup:
- !Container base
- !Install [postgresql, postgresql-client]
- !Sh echo hello > /etc/motd
- !EnsureDir /data
- !Remove /var/cache/apk
- !CreateUser { name: postgres, uid: 100, gid: 101 }
- !Copy { source: conf, path: /etc/app }
environ:
  PGDATA: /data
";
        let spec: ContainerSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.distribution, Some(Distribution::Alpine));
        assert_eq!(spec.setup.len(), 7);
        assert_eq!(spec.parent(), Some("base"));
        assert_eq!(
            spec.setup[1],
            SetupStep::InstallPackages(vec![
                "postgresql".to_string(),
                "postgresql-client".to_string()
            ])
        );
        match &spec.setup[5] {
            SetupStep::CreateUser(user) => {
                assert_eq!(user.group_name(), "postgres");
                assert_eq!(user.home_dir(), PathBuf::from("/home/postgres"));
                assert_eq!(user.shell, "/bin/sh");
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &spec.setup[6] {
            SetupStep::Copy(copy) => assert_eq!(copy.umask, FileMode(0o002)),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn unknown_field_rejected() {
        let yaml = "setups: []";
        assert!(serde_yaml::from_str::<ContainerSpec>(yaml).is_err());
    }

    #[test]
    fn distribution_from_os_release() {
        assert_eq!("\"alpine\"".parse(), Ok(Distribution::Alpine));
        assert_eq!("Ubuntu".parse(), Ok(Distribution::Ubuntu));
        assert!("arch".parse::<Distribution>().is_err());
    }
}
