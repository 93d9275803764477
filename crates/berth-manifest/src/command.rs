//! Command definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use berth_common::Signal;
use serde::{Deserialize, Serialize};

/// Default grace period between the stop signal and `SIGKILL`.
pub const DEFAULT_KILL_UNRESPONSIVE_AFTER: f64 = 2.0;

/// A runnable command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandSpec {
    /// One process.
    #[serde(rename = "Command")]
    Single(SingleCommand),
    /// Several processes supervised as a unit.
    #[serde(rename = "Supervise")]
    Supervised(SupervisedCommand),
}

impl CommandSpec {
    /// Description shown by `berth list`.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Single(single) => single.description.as_deref(),
            Self::Supervised(group) => group.description.as_deref(),
        }
    }
}

/// A single process run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SingleCommand {
    /// Container the process runs in.
    pub container: String,
    /// What to run.
    pub run: RunScript,
    /// User id of the process.
    #[serde(default)]
    pub uid: u32,
    /// Group id of the process.
    #[serde(default)]
    pub gid: u32,
    /// Overrides on top of the container environment.
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
    /// Working directory inside the container; defaults to the project mount.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Description shown by `berth list`.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether berth waits for the process or becomes it.
    #[serde(default)]
    pub mode: RunMode,
}

/// The program of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunScript {
    /// Script passed to `/bin/sh -c`.
    Shell(String),
    /// Program and arguments, executed directly.
    Argv(Vec<String>),
}

impl RunScript {
    /// Full argument vector, with `extra` arguments appended.
    ///
    /// Shell scripts receive extra arguments as positional parameters, with
    /// `arg0` as `$0`.
    #[must_use]
    pub fn argv(&self, arg0: &str, extra: &[String]) -> Vec<String> {
        match self {
            Self::Shell(script) => {
                let mut argv = vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.clone(),
                    arg0.to_string(),
                ];
                argv.extend(extra.iter().cloned());
                argv
            }
            Self::Argv(args) => args.iter().chain(extra).cloned().collect(),
        }
    }
}

/// How the runner treats a single command's process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Spawn the process and wait for it.
    #[default]
    Spawn,
    /// Replace berth with the process so signals reach it directly.
    Replace,
}

/// A group of processes supervised as one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SupervisedCommand {
    /// Description shown by `berth list`.
    #[serde(default)]
    pub description: Option<String>,
    /// Group failure policy.
    #[serde(default)]
    pub mode: SupervisionMode,
    /// Seconds between the stop signal and `SIGKILL`.
    #[serde(default = "default_kill_unresponsive_after")]
    pub kill_unresponsive_after: f64,
    /// Signal sent to children when the group stops.
    #[serde(default = "default_stop_signal")]
    pub stop_signal: Signal,
    /// Children keyed by name.
    pub children: BTreeMap<String, ChildCommand>,
}

const fn default_kill_unresponsive_after() -> f64 {
    DEFAULT_KILL_UNRESPONSIVE_AFTER
}

const fn default_stop_signal() -> Signal {
    Signal::Term
}

impl SupervisedCommand {
    /// Grace period as a duration; invalid values fall back to the default.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.kill_unresponsive_after)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_KILL_UNRESPONSIVE_AFTER))
    }

    /// Iterate children as single commands.
    pub fn singles(&self) -> impl Iterator<Item = (&str, &SingleCommand)> {
        self.children
            .iter()
            .map(|(name, child)| (name.as_str(), child.single()))
    }
}

/// A supervised child, written as `!Command { ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildCommand {
    /// The child's process definition.
    Command(SingleCommand),
}

impl ChildCommand {
    /// The child's process definition.
    #[must_use]
    pub const fn single(&self) -> &SingleCommand {
        match self {
            Self::Command(single) => single,
        }
    }
}

/// What happens to siblings when a child exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisionMode {
    /// The first abnormal exit stops every other child.
    #[default]
    StopOnFailure,
    /// Children run to completion independently.
    WaitAll,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single() {
        let yaml = r"
!Command
container: app
run: python manage.py runserver
uid: 1000
environ: { DEBUG: '1' }
";
        let cmd: CommandSpec = serde_yaml::from_str(yaml).unwrap();
        let CommandSpec::Single(single) = cmd else {
            panic!("expected single command");
        };
        assert_eq!(single.uid, 1000);
        assert_eq!(single.gid, 0);
        assert_eq!(single.mode, RunMode::Spawn);
        assert_eq!(single.environ["DEBUG"], "1");
    }

    #[test]
    fn parse_supervised() {
        let yaml = r"
!Supervise
description: app with database
kill-unresponsive-after: 0.5
children:
  db: !Command
    container: pg
    run: [postgres, -D, /data]
  app: !Command
    container: app
    run: exit 1
";
        let cmd: CommandSpec = serde_yaml::from_str(yaml).unwrap();
        let CommandSpec::Supervised(group) = cmd else {
            panic!("expected supervised command");
        };
        assert_eq!(group.mode, SupervisionMode::StopOnFailure);
        assert_eq!(group.stop_signal, Signal::Term);
        assert_eq!(group.grace_period(), Duration::from_millis(500));
        let names: Vec<_> = group.singles().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["app", "db"]);
        assert_eq!(
            group.children["db"].single().run,
            RunScript::Argv(vec![
                "postgres".to_string(),
                "-D".to_string(),
                "/data".to_string()
            ])
        );
    }

    #[test]
    fn shell_argv_passes_extra_arguments() {
        let run = RunScript::Shell("echo \"$@\"".to_string());
        assert_eq!(
            run.argv("berth-echo", &["a".to_string()]),
            vec!["/bin/sh", "-c", "echo \"$@\"", "berth-echo", "a"]
        );
        let run = RunScript::Argv(vec!["ls".to_string()]);
        assert_eq!(run.argv("x", &["-l".to_string()]), vec!["ls", "-l"]);
    }

    #[test]
    fn negative_grace_falls_back() {
        let group = SupervisedCommand {
            description: None,
            mode: SupervisionMode::WaitAll,
            kill_unresponsive_after: -1.0,
            stop_signal: Signal::Int,
            children: BTreeMap::new(),
        };
        assert_eq!(group.grace_period(), Duration::from_secs(2));
    }
}
