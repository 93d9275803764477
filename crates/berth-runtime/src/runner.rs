//! Process runner for single commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_common::{RunError, RunResult, VolumeError};
use berth_image::{Builder, BuiltImage, PROJECT_MOUNT};
use berth_manifest::environ;
use berth_manifest::{CommandSpec, Manifest, RunMode, SingleCommand, VolumeSpec};
use berth_sandbox::{LaunchSpec, Launcher, Mount, Process, ProcessExit};

use crate::config::RuntimeConfig;
use crate::signals::ExternalSignals;
use crate::volume::{InitCommand, MountHandle, VolumeManager};

/// A command ready to launch: image built, volumes attached.
///
/// Tmpfs volumes live as long as this value.
#[derive(Debug)]
pub struct PreparedCommand {
    /// Command or child name.
    pub name: String,
    /// Image the command runs in.
    pub image: Arc<BuiltImage>,
    /// Launch description.
    pub launch: LaunchSpec,
    /// Whether berth replaces itself with the process.
    pub mode: RunMode,
    volumes: Vec<MountHandle>,
}

impl PreparedCommand {
    /// Attached volumes.
    #[must_use]
    pub fn volumes(&self) -> &[MountHandle] {
        &self.volumes
    }
}

/// Runs manifest commands.
#[derive(Debug)]
pub struct Runner {
    config: RuntimeConfig,
    launcher: Arc<dyn Launcher>,
    builder: Builder,
    volumes: VolumeManager,
}

impl Runner {
    /// Create a runner with the configured launcher.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured isolation is unavailable.
    pub fn new(config: RuntimeConfig) -> RunResult<Self> {
        let launcher = config.launcher().map_err(|source| RunError::ExecFailed {
            command: "launcher".to_string(),
            source,
        })?;
        Ok(Self::with_launcher(config, launcher))
    }

    /// Create a runner with an explicit launcher.
    #[must_use]
    pub fn with_launcher(config: RuntimeConfig, launcher: Arc<dyn Launcher>) -> Self {
        let builder = Builder::new(config.paths.clone(), Arc::clone(&launcher));
        let volumes = VolumeManager::new(config.paths.clone());
        volumes.sweep_tmpfs();
        Self {
            config,
            launcher,
            builder,
            volumes,
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Image builder.
    #[must_use]
    pub const fn builder(&self) -> &Builder {
        &self.builder
    }

    /// Volume manager.
    #[must_use]
    pub const fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Launcher used for commands.
    #[must_use]
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        Arc::clone(&self.launcher)
    }

    /// Build the image, attach and initialize volumes, resolve the environment.
    ///
    /// # Errors
    ///
    /// Returns the build, volume or lookup failure.
    pub async fn prepare(
        &self,
        manifest: &Manifest,
        name: &str,
        command: &SingleCommand,
        args: &[String],
        overrides: &[(String, String)],
    ) -> RunResult<PreparedCommand> {
        let container = manifest.container(&command.container)?;
        let image = self.builder.build(manifest, &command.container).await?;

        let mut volumes = Vec::with_capacity(container.volumes.len());
        for (mount_point, volume) in &container.volumes {
            let attach_failed = |source| RunError::VolumeAttachFailed {
                mount_point: mount_point.clone(),
                source,
            };
            let mut handle = self
                .volumes
                .attach(volume, mount_point)
                .map_err(attach_failed)?;
            if let VolumeSpec::Persistent(persistent) = volume {
                if !handle.is_ready() {
                    let init = match &persistent.init_command {
                        Some(init) => Some(
                            self.init_command(
                                manifest,
                                &command.container,
                                &image,
                                mount_point,
                                &persistent.name,
                                init,
                            )
                            .await?,
                        ),
                        None => None,
                    };
                    self.volumes
                        .maybe_initialize(persistent, &mut handle, init.as_ref())
                        .await
                        .map_err(attach_failed)?;
                }
            }
            volumes.push(handle);
        }

        let env = environ::resolve(&container.environ, &command.environ, overrides);
        let workdir = command
            .workdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(PROJECT_MOUNT));
        let mut launch = LaunchSpec::new(&image.root, command.run.argv(name, args))
            .env(env)
            .workdir(workdir)
            .user(command.uid, command.gid);
        if manifest.base_dir.is_dir() {
            launch = launch.mount(Mount::bind(&manifest.base_dir, PROJECT_MOUNT));
        }
        for handle in &volumes {
            launch = launch.mount(handle.to_mount());
        }

        tracing::debug!(
            command = name,
            container = %command.container,
            image = %image.short_digest(),
            volumes = volumes.len(),
            "Prepared command"
        );
        Ok(PreparedCommand {
            name: name.to_string(),
            image,
            launch,
            mode: command.mode,
            volumes,
        })
    }

    /// Launch description for a volume's init command.
    async fn init_command(
        &self,
        manifest: &Manifest,
        consumer: &str,
        consumer_image: &Arc<BuiltImage>,
        mount_point: &Path,
        volume: &str,
        init: &str,
    ) -> RunResult<InitCommand> {
        let not_found = || RunError::VolumeAttachFailed {
            mount_point: mount_point.to_path_buf(),
            source: VolumeError::InitCommandNotFound {
                volume: volume.to_string(),
                command: init.to_string(),
            },
        };
        let command = manifest.single(init).map_err(|_| not_found())?;
        let container = manifest.container(&command.container).map_err(|_| not_found())?;

        let image = if command.container == consumer {
            Arc::clone(consumer_image)
        } else {
            self.builder.build(manifest, &command.container).await?
        };

        let env = environ::resolve(&container.environ, &command.environ, &[]);
        let mut launch = LaunchSpec::new(&image.root, command.run.argv(init, &[])).env(env);
        if manifest.base_dir.is_dir() {
            launch = launch.mount(Mount::bind(&manifest.base_dir, PROJECT_MOUNT));
        }
        Ok(InitCommand {
            name: init.to_string(),
            launch,
            launcher: Arc::clone(&self.launcher),
        })
    }

    /// Start a prepared command.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::ExecFailed`] when the process cannot be started.
    pub fn spawn(&self, prepared: &PreparedCommand) -> RunResult<Process> {
        self.launcher
            .spawn(&prepared.launch)
            .map_err(|source| RunError::ExecFailed {
                command: prepared.name.clone(),
                source,
            })
    }

    /// Run a single command to completion.
    ///
    /// In replace mode this only returns on failure. Otherwise signals sent
    /// to berth are forwarded to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is unknown, supervised, or cannot be
    /// prepared or started.
    pub async fn run(
        &self,
        manifest: &Manifest,
        name: &str,
        args: &[String],
        overrides: &[(String, String)],
    ) -> RunResult<ProcessExit> {
        let CommandSpec::Single(command) = manifest.command(name)? else {
            return Err(RunError::CommandNotFound {
                name: name.to_string(),
            });
        };
        let prepared = self.prepare(manifest, name, command, args, overrides).await?;

        if prepared.mode == RunMode::Replace {
            tracing::debug!(command = name, "Replacing berth with command");
            let source = self.launcher.exec(&prepared.launch);
            return Err(RunError::ExecFailed {
                command: name.to_string(),
                source,
            });
        }

        let mut signals = ExternalSignals::listen()?;
        let mut process = self.spawn(&prepared)?;
        tracing::info!(command = name, pid = process.pid(), "Started command");

        let exit = loop {
            tokio::select! {
                exit = process.wait() => {
                    break exit.map_err(|source| RunError::ExecFailed {
                        command: name.to_string(),
                        source,
                    })?;
                }
                signal = signals.recv() => {
                    tracing::debug!(command = name, %signal, "Forwarding signal");
                    if let Err(e) = process.signal(signal) {
                        tracing::warn!(command = name, error = %e, "Failed to forward signal");
                    }
                }
            }
        };
        tracing::info!(command = name, %exit, "Command finished");
        Ok(exit)
    }
}
