//! Error taxonomy for berth.
//!
//! Every failure belongs to one stage: building an image ([`BuildError`]),
//! preparing a volume ([`VolumeError`]) or running a process ([`RunError`]).
//! [`BerthError`] wraps them at the top level and names the stage.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BuildError`].
pub type BuildResult<T> = Result<T, BuildError>;
/// Result type alias using [`VolumeError`].
pub type VolumeResult<T> = Result<T, VolumeError>;
/// Result type alias using [`RunError`].
pub type RunResult<T> = Result<T, RunError>;
/// Result type alias using [`LaunchError`].
pub type LaunchResult<T> = Result<T, LaunchError>;
/// Result type alias using [`BerthError`].
pub type BerthResult<T> = Result<T, BerthError>;

/// Failures of the process execution primitive.
#[derive(Error, Diagnostic, Debug)]
pub enum LaunchError {
    /// The process could not be spawned.
    #[error("Failed to spawn {program}: {source}")]
    #[diagnostic(code(berth::launch::spawn))]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed.
    #[error("Failed to wait for pid {pid}: {source}")]
    #[diagnostic(code(berth::launch::wait))]
    Wait {
        /// Process id.
        pid: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal failed.
    #[error("Failed to send signal {signal} to pid {pid}: {source}")]
    #[diagnostic(code(berth::launch::signal))]
    Signal {
        /// Process id.
        pid: u32,
        /// Signal name.
        signal: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Replacing the current process image failed.
    #[error("Failed to exec {program}: {source}")]
    #[diagnostic(code(berth::launch::exec))]
    Exec {
        /// Program that failed to exec.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A path could not be passed to the kernel.
    #[error("Invalid path for launch: {path}")]
    #[diagnostic(code(berth::launch::invalid_path))]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },

    /// Isolation requested that this host cannot provide.
    #[error("Isolation not supported: {reason}")]
    #[diagnostic(
        code(berth::launch::unsupported),
        help("Namespace isolation requires root; use `--isolation host` when running rootless")
    )]
    Unsupported {
        /// Why the isolation cannot be provided.
        reason: String,
    },
}

/// Failures while constructing an image.
#[derive(Error, Diagnostic, Debug)]
pub enum BuildError {
    /// A requested package does not exist in the distribution's repositories.
    #[error("Package not found: {package} (distribution: {distribution})")]
    #[diagnostic(
        code(berth::build::package_not_found),
        help("Check the package name for this distribution")
    )]
    PackageNotFound {
        /// Missing package name.
        package: String,
        /// Distribution identity used for resolution.
        distribution: String,
    },

    /// A shell or install step exited non-zero.
    #[error("Setup step #{step} of {container} failed with exit code {exit_code}")]
    #[diagnostic(code(berth::build::shell_step_failed))]
    ShellStepFailed {
        /// Container being built.
        container: String,
        /// One-based step index.
        step: usize,
        /// Exit code of the step (128 + signal when killed).
        exit_code: i32,
    },

    /// A filesystem path required by a step is occupied by something else.
    #[error("Path conflict at {path}: {reason}")]
    #[diagnostic(code(berth::build::path_conflict))]
    PathConflict {
        /// Conflicting path inside the image.
        path: PathBuf,
        /// What is in the way.
        reason: String,
    },

    /// A user or group entry clashes with an existing one.
    #[error("User conflict for {user}: {reason}")]
    #[diagnostic(
        code(berth::build::user_conflict),
        help("uid/gid are fixed so volumes stay owned correctly across rebuilds")
    )]
    UserConflict {
        /// User or group name.
        user: String,
        /// Description of the clash.
        reason: String,
    },

    /// No package resolver is known for the container's distribution.
    #[error("Cannot install packages in {container}: unknown distribution {distribution}")]
    #[diagnostic(
        code(berth::build::unknown_distribution),
        help("Set `distribution` on the container or provide etc/os-release in its root")
    )]
    UnknownDistribution {
        /// Container being built.
        container: String,
        /// Detected or declared distribution, if any.
        distribution: String,
    },

    /// The base system of a distribution could not be fetched or unpacked.
    #[error("Failed to bootstrap {distribution} from {url}: {reason}")]
    #[diagnostic(
        code(berth::build::bootstrap),
        help("Check network access, or start the container from `!Container` instead")
    )]
    BootstrapFailed {
        /// Distribution being bootstrapped.
        distribution: String,
        /// Archive location.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// A step path is not absolute or escapes the root.
    #[error("Invalid path in setup step: {path}")]
    #[diagnostic(
        code(berth::build::invalid_path),
        help("Paths must be absolute and must not contain `..`")
    )]
    InvalidPath {
        /// The rejected path.
        path: String,
    },

    /// A referenced container is not declared.
    #[error("Container not found: {name}")]
    #[diagnostic(code(berth::build::container_not_found))]
    ContainerNotFound {
        /// The missing container name.
        name: String,
    },

    /// A step process could not be launched.
    #[error("Failed to launch setup step #{step}: {source}")]
    #[diagnostic(code(berth::build::launch))]
    Launch {
        /// One-based step index.
        step: usize,
        /// Launcher failure.
        #[source]
        source: LaunchError,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::build::io))]
    Io(#[from] std::io::Error),
}

/// Failures while attaching or initializing volumes.
#[derive(Error, Diagnostic, Debug)]
pub enum VolumeError {
    /// The init command exited non-zero.
    #[error("Init command for volume {volume} failed with exit code {exit_code}")]
    #[diagnostic(
        code(berth::volume::init_failed),
        help("The volume was left uninitialized and will be initialized again on next run")
    )]
    InitCommandFailed {
        /// Volume name.
        volume: String,
        /// Exit code of the init command.
        exit_code: i32,
    },

    /// The init command is not a single command in the manifest.
    #[error("Init command {command} for volume {volume} is not defined")]
    #[diagnostic(code(berth::volume::init_not_found))]
    InitCommandNotFound {
        /// Volume name.
        volume: String,
        /// Referenced command.
        command: String,
    },

    /// The init command could not be launched.
    #[error("Failed to launch init command for volume {volume}: {source}")]
    #[diagnostic(code(berth::volume::init_launch))]
    InitLaunch {
        /// Volume name.
        volume: String,
        /// Launcher failure.
        #[source]
        source: LaunchError,
    },

    /// Changing ownership of the backing store failed.
    #[error("Failed to chown {path} to {uid}:{gid}: {source}")]
    #[diagnostic(code(berth::volume::ownership))]
    OwnershipChangeFailed {
        /// Backing store path.
        path: PathBuf,
        /// Requested owner uid.
        uid: u32,
        /// Requested owner gid.
        gid: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Another process is initializing the same volume.
    #[error("Volume {volume} is being initialized by another berth process")]
    #[diagnostic(
        code(berth::volume::busy),
        help("Wait for the other berth process to finish and retry")
    )]
    VolumeBusy {
        /// Volume name.
        volume: String,
        /// Pid recorded by the lock holder, once it has written one.
        pid: Option<u32>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::volume::io))]
    Io(#[from] std::io::Error),
}

/// Failures while running commands.
#[derive(Error, Diagnostic, Debug)]
pub enum RunError {
    /// A referenced container is not declared.
    #[error("Container not found: {name}")]
    #[diagnostic(code(berth::run::container_not_found))]
    ContainerNotFound {
        /// The missing container name.
        name: String,
    },

    /// A referenced command is not declared.
    #[error("Command not found: {name}")]
    #[diagnostic(
        code(berth::run::command_not_found),
        help("Run `berth list` to see available commands")
    )]
    CommandNotFound {
        /// The missing command name.
        name: String,
    },

    /// The command process could not be launched.
    #[error("Failed to execute {command}: {source}")]
    #[diagnostic(code(berth::run::exec_failed))]
    ExecFailed {
        /// Command name.
        command: String,
        /// Launcher failure.
        #[source]
        source: LaunchError,
    },

    /// A volume could not be attached.
    #[error("Failed to attach volume at {mount_point}: {source}")]
    #[diagnostic(code(berth::run::volume_attach_failed))]
    VolumeAttachFailed {
        /// Mount point inside the container.
        mount_point: PathBuf,
        /// Volume failure.
        #[source]
        source: VolumeError,
    },

    /// The image for the command could not be built.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    /// A supervised child failed before it was running.
    #[error("Child {child} failed to start: {source}")]
    #[diagnostic(code(berth::run::child_failed_to_start))]
    ChildFailedToStart {
        /// Child name.
        child: String,
        /// Why the child did not start.
        #[source]
        source: Box<RunError>,
    },

    /// A supervised child survived forced termination.
    #[error("Child {child} did not exit after being killed")]
    #[diagnostic(code(berth::run::child_timed_out))]
    ChildTimedOutOnShutdown {
        /// Child name.
        child: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::run::io))]
    Io(#[from] std::io::Error),
}

/// Failures while loading the manifest.
#[derive(Error, Diagnostic, Debug)]
pub enum ManifestError {
    /// No manifest was found.
    #[error("No berth.yaml found in {start} or any parent directory")]
    #[diagnostic(code(berth::manifest::not_found))]
    NotFound {
        /// Directory the search started from.
        start: PathBuf,
    },

    /// The manifest could not be parsed.
    #[error("Failed to parse {path}: {message}")]
    #[diagnostic(code(berth::manifest::parse))]
    Parse {
        /// Manifest file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// The manifest parsed but is inconsistent.
    #[error("Invalid manifest: {message}")]
    #[diagnostic(code(berth::manifest::invalid))]
    Invalid {
        /// What is wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::manifest::io))]
    Io(#[from] std::io::Error),
}

/// Top-level error naming the failed stage.
#[derive(Error, Diagnostic, Debug)]
pub enum BerthError {
    /// Manifest stage.
    #[error("manifest: {0}")]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    /// Build stage.
    #[error("build: {0}")]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    /// Volume stage.
    #[error("volume: {0}")]
    #[diagnostic(transparent)]
    Volume(#[from] VolumeError),

    /// Run stage.
    #[error("run: {0}")]
    #[diagnostic(transparent)]
    Run(RunError),

    /// Configuration error.
    #[error("config: {message}")]
    #[diagnostic(code(berth::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl BerthError {
    /// Stage name used in user-facing reports.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "manifest",
            Self::Build(_) => "build",
            Self::Volume(_) => "volume",
            Self::Run(_) => "run",
            Self::Config { .. } => "config",
        }
    }
}

impl From<RunError> for BerthError {
    /// Lift build and volume failures that surfaced while running to their own stage.
    fn from(err: RunError) -> Self {
        match err {
            RunError::Build(e) => Self::Build(e),
            RunError::VolumeAttachFailed { source, .. } => Self::Volume(source),
            other => Self::Run(other),
        }
    }
}
