//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_common::{BerthError, BerthResult, ManifestError};
use berth_manifest::environ::parse_override;
use berth_manifest::{CommandSpec, Manifest};
use berth_runtime::{Runner, RuntimeConfig};
use berth_sandbox::Isolation;
use berth_supervisor::{ChildFilter, Supervisor};
use clap::{Parser, Subcommand};
use console::style;
use tabled::{Table, Tabled};

/// berth - container-based development environments
#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to berth.yaml (default: nearest one in the current directory or its parents)
    #[arg(short, long, global = true, env = "BERTH_FILE")]
    pub file: Option<PathBuf>,

    /// Root directory for images and volumes
    #[arg(long, global = true, env = "BERTH_ROOT")]
    pub root: Option<PathBuf>,

    /// Process isolation: auto, host or namespace
    #[arg(long, global = true, env = "BERTH_ISOLATION", default_value_t = Isolation::Auto)]
    pub isolation: Isolation,

    /// Give commands a private network with loopback only
    #[arg(long, global = true)]
    pub isolate_network: bool,

    /// Seconds between the stop signal and SIGKILL for supervised commands
    #[arg(long, global = true)]
    pub grace_period: Option<f64>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// berth commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a command from berth.yaml
    Run {
        /// Environment override, may be repeated
        #[arg(short = 'E', long = "environ", value_name = "KEY=VALUE", value_parser = parse_override)]
        environ: Vec<(String, String)>,

        /// Start only these children of a supervised command
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Do not start these children of a supervised command
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Command name
        command: String,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Build a container image
    Build {
        /// Container name
        container: String,

        /// Print the image digest instead of its root
        #[arg(long)]
        print_digest: bool,
    },

    /// Remove image versions the manifest no longer produces
    Clean {
        /// Remove old versions of declared containers
        #[arg(long, required = true)]
        old: bool,
    },

    /// List commands
    List {
        /// List containers instead
        #[arg(long)]
        containers: bool,

        /// Include commands starting with an underscore
        #[arg(short, long)]
        all: bool,
    },

    /// Print the directory containing berth.yaml
    BaseDir,
}

#[derive(Tabled)]
struct ListRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: &'static str,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error naming the stage that failed.
    pub async fn execute(self) -> BerthResult<i32> {
        match &self.command {
            Commands::Run {
                environ,
                only,
                exclude,
                command,
                args,
            } => {
                let manifest = Arc::new(self.load_manifest()?);
                let runner = Arc::new(Runner::new(self.runtime_config()?)?);
                match manifest.command(command)? {
                    CommandSpec::Single(_) => {
                        if !only.is_empty() || !exclude.is_empty() {
                            return Err(config_error(
                                "--only and --exclude apply to supervised commands",
                            ));
                        }
                        let exit = runner.run(&manifest, command, args, environ).await?;
                        tracing::debug!(command = %command, %exit, "Run finished");
                        Ok(exit.code())
                    }
                    CommandSpec::Supervised(_) => {
                        if !args.is_empty() {
                            return Err(config_error("supervised commands take no arguments"));
                        }
                        let filter = ChildFilter {
                            only: only.clone(),
                            exclude: exclude.clone(),
                        };
                        let status = Supervisor::new(runner)
                            .run(Arc::clone(&manifest), command, &filter, environ)
                            .await?;
                        if let Some(child) = &status.failed {
                            let state = status
                                .children
                                .get(child)
                                .map(ToString::to_string)
                                .unwrap_or_default();
                            eprintln!("{} {child} {state}", style("failed:").red().bold());
                        }
                        Ok(status.code())
                    }
                }
            }

            Commands::Build {
                container,
                print_digest,
            } => {
                let manifest = self.load_manifest()?;
                let runner = Runner::new(self.runtime_config()?)?;
                let image = runner.builder().build(&manifest, container).await?;
                if *print_digest {
                    println!("{}", image.digest);
                } else {
                    println!("{}", image.root.display());
                }
                Ok(0)
            }

            Commands::Clean { old: _ } => {
                let manifest = self.load_manifest()?;
                let runner = Runner::new(self.runtime_config()?)?;
                let removed = runner.builder().clean_old(&manifest).await?;
                println!("Removed {removed} old image(s)");
                Ok(0)
            }

            Commands::List { containers, all } => {
                let manifest = self.load_manifest()?;
                let rows: Vec<ListRow> = if *containers {
                    manifest
                        .containers
                        .iter()
                        .map(|(name, container)| ListRow {
                            name: name.clone(),
                            kind: "container",
                            description: container.description.clone().unwrap_or_default(),
                        })
                        .collect()
                } else {
                    manifest
                        .commands
                        .iter()
                        .filter(|(name, _)| *all || !name.starts_with('_'))
                        .map(|(name, command)| ListRow {
                            name: name.clone(),
                            kind: match command {
                                CommandSpec::Single(_) => "command",
                                CommandSpec::Supervised(_) => "supervise",
                            },
                            description: command.description().unwrap_or_default().to_string(),
                        })
                        .collect()
                };

                if rows.is_empty() {
                    println!("Nothing defined");
                } else {
                    println!("{}", Table::new(rows));
                }
                Ok(0)
            }

            Commands::BaseDir => {
                let manifest = self.load_manifest()?;
                println!("{}", manifest.base_dir.display());
                Ok(0)
            }
        }
    }

    fn load_manifest(&self) -> Result<Manifest, ManifestError> {
        let path = match &self.file {
            Some(path) => path.clone(),
            None => Manifest::discover(&std::env::current_dir()?)?,
        };
        let path = std::fs::canonicalize(&path).map_err(|_| ManifestError::NotFound {
            start: path.clone(),
        })?;
        tracing::debug!(path = %path.display(), "Loading manifest");
        Manifest::from_file(&path)
    }

    fn runtime_config(&self) -> BerthResult<RuntimeConfig> {
        let mut config = RuntimeConfig::default().with_isolation(self.isolation);
        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        if self.isolate_network {
            config = config.with_network_isolation();
        }
        if let Some(seconds) = self.grace_period {
            let grace = Duration::try_from_secs_f64(seconds)
                .map_err(|e| config_error(&format!("--grace-period {seconds}: {e}")))?;
            config = config.with_grace_period(grace);
        }
        Ok(config)
    }
}

fn config_error(message: &str) -> BerthError {
    BerthError::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments() {
        let cli = Cli::try_parse_from([
            "berth", "run", "-E", "A=1", "--only", "db,web", "test", "--", "-x", "y",
        ])
        .unwrap();
        let Commands::Run {
            environ,
            only,
            command,
            args,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(environ, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(only, vec!["db", "web"]);
        assert_eq!(command, "test");
        assert_eq!(args, vec!["-x", "y"]);
    }

    #[test]
    fn isolation_flag() {
        let cli = Cli::try_parse_from(["berth", "--isolation", "host", "base-dir"]).unwrap();
        assert_eq!(cli.isolation, Isolation::Host);
        assert!(Cli::try_parse_from(["berth", "--isolation", "vm", "base-dir"]).is_err());
    }

    #[test]
    fn clean_needs_a_selection() {
        assert!(Cli::try_parse_from(["berth", "clean"]).is_err());
        let cli = Cli::try_parse_from(["berth", "clean", "--old"]).unwrap();
        assert!(matches!(cli.command, Commands::Clean { old: true }));
    }

    #[test]
    fn bad_override_rejected() {
        assert!(Cli::try_parse_from(["berth", "run", "-E", "novalue", "x"]).is_err());
    }
}
