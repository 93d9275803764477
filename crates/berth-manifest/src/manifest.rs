//! The manifest and its name registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use berth_common::{ManifestError, Name, RunError, RunResult};
use serde::{Deserialize, Serialize};

use crate::command::{CommandSpec, SingleCommand};
use crate::container::{ContainerSpec, SetupStep};
use crate::volume::VolumeSpec;

/// File name searched for by [`Manifest::discover`].
pub const MANIFEST_FILE: &str = "berth.yaml";

/// A parsed `berth.yaml`.
///
/// Passed by reference to the builder, runner and supervisor as the only
/// source of container and command names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Containers keyed by name.
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSpec>,

    /// Commands keyed by name.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,

    /// Directory containing the manifest; mounted as the project directory.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Manifest {
    /// Parse and validate from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_yaml(yaml: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let mut manifest: Self = serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse {
            path: PathBuf::from(MANIFEST_FILE),
            message: e.to_string(),
        })?;
        manifest.base_dir = base_dir.into();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_yaml(&content, base_dir).map_err(|e| match e {
            ManifestError::Parse { message, .. } => ManifestError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Find the nearest `berth.yaml` in `start` or its parents.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotFound`] when no ancestor has one.
    pub fn discover(start: &Path) -> Result<PathBuf, ManifestError> {
        start
            .ancestors()
            .map(|dir| dir.join(MANIFEST_FILE))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ManifestError::NotFound {
                start: start.to_path_buf(),
            })
    }

    /// Look up a container.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::ContainerNotFound`] for unknown names.
    pub fn container(&self, name: &str) -> RunResult<&ContainerSpec> {
        self.containers
            .get(name)
            .ok_or_else(|| RunError::ContainerNotFound {
                name: name.to_string(),
            })
    }

    /// Look up a command.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::CommandNotFound`] for unknown names.
    pub fn command(&self, name: &str) -> RunResult<&CommandSpec> {
        self.commands
            .get(name)
            .ok_or_else(|| RunError::CommandNotFound {
                name: name.to_string(),
            })
    }

    /// Look up a command that must be a single process.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::CommandNotFound`] for unknown or supervised commands.
    pub fn single(&self, name: &str) -> RunResult<&SingleCommand> {
        match self.command(name)? {
            CommandSpec::Single(single) => Ok(single),
            CommandSpec::Supervised(_) => Err(RunError::CommandNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Check cross references and names.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (name, container) in &self.containers {
            check_name("container", name)?;
            self.validate_container(name, container)?;
        }
        for (name, command) in &self.commands {
            check_name("command", name)?;
            match command {
                CommandSpec::Single(single) => self.validate_single(name, single)?,
                CommandSpec::Supervised(group) => {
                    if group.children.is_empty() {
                        return Err(invalid(format!("command {name} has no children")));
                    }
                    if !group.kill_unresponsive_after.is_finite()
                        || group.kill_unresponsive_after < 0.0
                    {
                        return Err(invalid(format!(
                            "command {name}: kill-unresponsive-after must be a non-negative number"
                        )));
                    }
                    for (child, single) in group.singles() {
                        check_name("child", child)?;
                        self.validate_single(&format!("{name}.{child}"), single)?;
                    }
                }
            }
        }
        for name in self.containers.keys() {
            self.check_inheritance(name)?;
        }
        tracing::debug!(
            containers = self.containers.len(),
            commands = self.commands.len(),
            "Manifest validated"
        );
        Ok(())
    }

    fn validate_container(&self, name: &str, container: &ContainerSpec) -> Result<(), ManifestError> {
        for (index, step) in container.setup.iter().enumerate() {
            if let SetupStep::Inherit(parent) = step {
                if index != 0 {
                    return Err(invalid(format!(
                        "container {name}: !Container must be the first step"
                    )));
                }
                if !self.containers.contains_key(parent) {
                    return Err(invalid(format!(
                        "container {name} inherits unknown container {parent}"
                    )));
                }
            }
        }
        for (mount_point, volume) in &container.volumes {
            if !mount_point.is_absolute() {
                return Err(invalid(format!(
                    "container {name}: mount point {} must be absolute",
                    mount_point.display()
                )));
            }
            match volume {
                VolumeSpec::Persistent(persistent) => {
                    check_name("volume", &persistent.name)?;
                    if let Some(init) = &persistent.init_command {
                        match self.commands.get(init) {
                            Some(CommandSpec::Single(_)) => {}
                            Some(CommandSpec::Supervised(_)) => {
                                return Err(invalid(format!(
                                    "volume {}: init-command {init} must be a single command",
                                    persistent.name
                                )));
                            }
                            None => {
                                return Err(invalid(format!(
                                    "volume {}: init-command {init} is not defined",
                                    persistent.name
                                )));
                            }
                        }
                    }
                }
                VolumeSpec::Tmpfs(tmpfs) => {
                    for subdir in tmpfs.subdirs.keys() {
                        let relative = subdir
                            .components()
                            .all(|c| matches!(c, Component::Normal(_)));
                        if !relative || subdir.as_os_str().is_empty() {
                            return Err(invalid(format!(
                                "container {name}: tmpfs subdir {} must be a plain relative path",
                                subdir.display()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_single(&self, name: &str, single: &SingleCommand) -> Result<(), ManifestError> {
        if !self.containers.contains_key(&single.container) {
            return Err(invalid(format!(
                "command {name} refers to unknown container {}",
                single.container
            )));
        }
        if let Some(workdir) = &single.workdir {
            if !workdir.is_absolute() {
                return Err(invalid(format!(
                    "command {name}: workdir {} must be absolute",
                    workdir.display()
                )));
            }
        }
        Ok(())
    }

    fn check_inheritance(&self, start: &str) -> Result<(), ManifestError> {
        let mut seen = BTreeSet::new();
        let mut current = start;
        while let Some(parent) = self.containers.get(current).and_then(ContainerSpec::parent) {
            if !seen.insert(current) {
                return Err(invalid(format!(
                    "container {start} has a circular !Container chain"
                )));
            }
            current = parent;
        }
        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), ManifestError> {
    if Name::is_valid(name) {
        Ok(())
    } else {
        Err(invalid(format!("invalid {kind} name {name:?}")))
    }
}

fn invalid(message: String) -> ManifestError {
    ManifestError::Invalid { message }
}
