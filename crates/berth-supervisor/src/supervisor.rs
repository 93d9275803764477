//! Supervision loop for `!Supervise` commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_common::{LaunchError, RunError, RunResult, Signal};
use berth_manifest::{CommandSpec, Manifest, SingleCommand, SupervisedCommand, SupervisionMode};
use berth_runtime::{ExternalSignals, Runner};
use berth_sandbox::ProcessExit;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::child::ChildState;

/// Restricts which children of a group are started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildFilter {
    /// Start only these children. Empty means all.
    pub only: Vec<String>,
    /// Never start these children.
    pub exclude: Vec<String>,
}

impl ChildFilter {
    /// Select the children of `group` to start.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::CommandNotFound`] when the filter names a child the
    /// group does not have.
    pub fn select<'a>(
        &self,
        name: &str,
        group: &'a SupervisedCommand,
    ) -> RunResult<Vec<(&'a str, &'a SingleCommand)>> {
        if let Some(unknown) = self
            .only
            .iter()
            .chain(&self.exclude)
            .find(|child| !group.children.contains_key(child.as_str()))
        {
            return Err(RunError::CommandNotFound {
                name: format!("{name}.{unknown}"),
            });
        }
        Ok(group
            .singles()
            .filter(|(child, _)| self.only.is_empty() || self.only.iter().any(|o| o == child))
            .filter(|(child, _)| !self.exclude.iter().any(|e| e == child))
            .collect())
    }
}

/// Outcome of a supervised group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupExitStatus {
    /// Final state of every started child.
    pub children: BTreeMap<String, ChildState>,
    /// First child whose exit failed the group.
    pub failed: Option<String>,
    /// Signal that interrupted the group, if any.
    pub interrupted: Option<Signal>,
}

impl GroupExitStatus {
    /// Whether every child exited cleanly on its own.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_none() && self.interrupted.is_none()
    }

    /// Exit code for berth: the failing child's code (`1` if it has none),
    /// `128 + signal` when interrupted, `0` otherwise.
    #[must_use]
    pub fn code(&self) -> i32 {
        if let Some(child) = &self.failed {
            return self
                .children
                .get(child)
                .and_then(|state| state.code())
                .unwrap_or(1);
        }
        match self.interrupted {
            Some(signal) => 128 + signal.as_raw(),
            None => 0,
        }
    }
}

/// Messages from child tasks to the supervision loop.
#[derive(Debug)]
enum ChildEvent {
    Started { child: String, pid: u32 },
    Exited { child: String, exit: ProcessExit },
    Lost { child: String, error: LaunchError },
    FailedToStart { child: String, error: RunError },
    Cancelled { child: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Stop signal sent; `SIGKILL` follows at the deadline.
    Stopping { kill_at: Instant },
    /// `SIGKILL` sent; children still alive at the deadline are abandoned.
    Killing { give_up_at: Instant },
}

impl Phase {
    const fn deadline(self) -> Option<Instant> {
        match self {
            Self::Running => None,
            Self::Stopping { kill_at } => Some(kill_at),
            Self::Killing { give_up_at } => Some(give_up_at),
        }
    }

    /// Signal a child that starts now should receive right away.
    const fn late_signal(self, stop_signal: Signal) -> Option<Signal> {
        match self {
            Self::Running => None,
            Self::Stopping { .. } => Some(stop_signal),
            Self::Killing { .. } => Some(Signal::Kill),
        }
    }
}

struct Child {
    state: ChildState,
    control: mpsc::UnboundedSender<Signal>,
}

/// Runs supervised command groups.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runner: Arc<Runner>,
}

impl Supervisor {
    /// Create a supervisor that launches children through `runner`.
    #[must_use]
    pub const fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }

    /// Run the supervised command `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::CommandNotFound`] unless `name` is a supervised
    /// command, plus every error of [`Supervisor::run_group`].
    pub async fn run(
        &self,
        manifest: Arc<Manifest>,
        name: &str,
        filter: &ChildFilter,
        overrides: &[(String, String)],
    ) -> RunResult<GroupExitStatus> {
        let CommandSpec::Supervised(group) = manifest.command(name)? else {
            return Err(RunError::CommandNotFound {
                name: name.to_string(),
            });
        };
        let group = group.clone();
        self.run_group(manifest, name, &group, filter, overrides)
            .await
    }

    /// Start the selected children of `group` and supervise them until all
    /// have finished.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::ChildFailedToStart`] once the group has wound down
    /// if a child could not be started, and
    /// [`RunError::ChildTimedOutOnShutdown`] if a child outlives `SIGKILL`.
    pub async fn run_group(
        &self,
        manifest: Arc<Manifest>,
        name: &str,
        group: &SupervisedCommand,
        filter: &ChildFilter,
        overrides: &[(String, String)],
    ) -> RunResult<GroupExitStatus> {
        let selected = filter.select(name, group)?;
        if selected.is_empty() {
            tracing::warn!(command = name, "No children selected");
        }

        let config = self.runner.config();
        let grace = config.grace_period.unwrap_or_else(|| group.grace_period());
        let reap_timeout = config.reap_timeout;

        let mut signals = ExternalSignals::listen()?;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut children = BTreeMap::new();

        for (child, single) in selected {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let mut state = ChildState::Pending;
            state.advance(ChildState::Starting);
            children.insert(
                child.to_string(),
                Child {
                    state,
                    control: control_tx,
                },
            );
            tasks.spawn(run_child(ChildTask {
                runner: Arc::clone(&self.runner),
                manifest: Arc::clone(&manifest),
                name: child.to_string(),
                command: single.clone(),
                overrides: overrides.to_vec(),
                events: events_tx.clone(),
                control: control_rx,
                stop: stop_rx.clone(),
            }));
        }
        drop(events_tx);
        tracing::info!(
            command = name,
            children = children.len(),
            mode = ?group.mode,
            "Starting supervised group"
        );

        let mut phase = Phase::Running;
        let mut failed: Option<String> = None;
        let mut start_failure: Option<(String, RunError)> = None;
        let mut interrupted: Option<Signal> = None;

        while children.values().any(|c| !c.state.is_terminal()) {
            let deadline = phase.deadline();
            let mut stop_with = None;

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        ChildEvent::Started { child, pid } => {
                            tracing::info!(command = name, child = %child, pid, "Child started");
                            if let Some(c) = children.get_mut(&child) {
                                c.state.advance(ChildState::Running { pid });
                                if let Some(signal) = phase.late_signal(group.stop_signal) {
                                    send(&child, c, signal);
                                }
                            }
                        }
                        ChildEvent::Exited { child, exit } => {
                            if let Some(c) = children.get_mut(&child) {
                                c.state.advance(exit.into());
                            }
                            if exit.success() {
                                tracing::info!(command = name, child = %child, "Child exited");
                            } else if phase == Phase::Running {
                                tracing::warn!(command = name, child = %child, %exit, "Child failed");
                                failed.get_or_insert(child);
                                if group.mode == SupervisionMode::StopOnFailure {
                                    stop_with = Some(group.stop_signal);
                                }
                            } else {
                                tracing::info!(command = name, child = %child, %exit, "Child stopped");
                            }
                        }
                        ChildEvent::Lost { child, error } => {
                            tracing::error!(command = name, child = %child, error = %error, "Lost track of child");
                            if let Some(c) = children.get_mut(&child) {
                                c.state.advance(ChildState::Lost);
                            }
                            if phase == Phase::Running {
                                failed.get_or_insert(child);
                                if group.mode == SupervisionMode::StopOnFailure {
                                    stop_with = Some(group.stop_signal);
                                }
                            }
                        }
                        ChildEvent::FailedToStart { child, error } => {
                            tracing::error!(command = name, child = %child, error = %error, "Child failed to start");
                            if let Some(c) = children.get_mut(&child) {
                                c.state.advance(ChildState::FailedToStart);
                            }
                            if start_failure.is_none() {
                                start_failure = Some((child, error));
                            }
                            if group.mode == SupervisionMode::StopOnFailure {
                                stop_with = Some(group.stop_signal);
                            }
                        }
                        ChildEvent::Cancelled { child } => {
                            tracing::debug!(command = name, child = %child, "Child cancelled");
                            if let Some(c) = children.get_mut(&child) {
                                c.state.advance(ChildState::Cancelled);
                            }
                        }
                    }
                }
                signal = signals.recv() => {
                    tracing::info!(command = name, %signal, "Forwarding signal to children");
                    interrupted.get_or_insert(signal);
                    for (child, c) in &children {
                        send(child, c, signal);
                    }
                    if phase == Phase::Running {
                        stop_tx.send_replace(true);
                        phase = Phase::Stopping { kill_at: Instant::now() + grace };
                    }
                }
                () = sleep_until(deadline), if deadline.is_some() => {
                    match phase {
                        Phase::Running => {}
                        Phase::Stopping { .. } => {
                            tracing::warn!(command = name, "Grace period expired, killing children");
                            for (child, c) in &children {
                                send(child, c, Signal::Kill);
                            }
                            phase = Phase::Killing { give_up_at: Instant::now() + reap_timeout };
                        }
                        Phase::Killing { .. } => {
                            let stuck = children
                                .iter()
                                .find(|(_, c)| !c.state.is_terminal())
                                .map(|(child, _)| child.clone())
                                .unwrap_or_default();
                            tracing::error!(command = name, child = %stuck, "Child did not exit after SIGKILL");
                            tasks.abort_all();
                            return Err(RunError::ChildTimedOutOnShutdown { child: stuck });
                        }
                    }
                }
            }

            if let Some(signal) = stop_with {
                if phase == Phase::Running {
                    tracing::info!(command = name, %signal, "Stopping group");
                    stop_tx.send_replace(true);
                    for (child, c) in &children {
                        send(child, c, signal);
                    }
                    phase = Phase::Stopping {
                        kill_at: Instant::now() + grace,
                    };
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(command = name, error = %e, "Child task panicked");
            }
        }

        if let Some((child, error)) = start_failure {
            return Err(RunError::ChildFailedToStart {
                child,
                source: Box::new(error),
            });
        }

        let status = GroupExitStatus {
            children: children
                .into_iter()
                .map(|(child, c)| (child, c.state))
                .collect(),
            failed,
            interrupted,
        };
        tracing::info!(
            command = name,
            code = status.code(),
            failed = status.failed.as_deref(),
            "Supervised group finished"
        );
        Ok(status)
    }
}

fn send(name: &str, child: &Child, signal: Signal) {
    if child.state.is_running() && child.control.send(signal).is_err() {
        tracing::debug!(child = name, %signal, "Child task already finished");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct ChildTask {
    runner: Arc<Runner>,
    manifest: Arc<Manifest>,
    name: String,
    command: SingleCommand,
    overrides: Vec<(String, String)>,
    events: mpsc::UnboundedSender<ChildEvent>,
    control: mpsc::UnboundedReceiver<Signal>,
    stop: watch::Receiver<bool>,
}

/// Prepare, start and wait for one child, relaying signals from the loop.
async fn run_child(task: ChildTask) {
    let ChildTask {
        runner,
        manifest,
        name,
        command,
        overrides,
        events,
        mut control,
        mut stop,
    } = task;

    let prepared = tokio::select! {
        prepared = runner.prepare(&manifest, &name, &command, &[], &overrides) => prepared,
        _ = stop.wait_for(|stopping| *stopping) => {
            let _ = events.send(ChildEvent::Cancelled { child: name });
            return;
        }
    };
    let mut prepared = match prepared {
        Ok(prepared) => prepared,
        Err(error) => {
            let _ = events.send(ChildEvent::FailedToStart { child: name, error });
            return;
        }
    };
    if *stop.borrow() {
        let _ = events.send(ChildEvent::Cancelled { child: name });
        return;
    }

    prepared.launch.new_process_group = true;
    let mut process = match runner.spawn(&prepared) {
        Ok(process) => process,
        Err(error) => {
            let _ = events.send(ChildEvent::FailedToStart { child: name, error });
            return;
        }
    };
    let _ = events.send(ChildEvent::Started {
        child: name.clone(),
        pid: process.pid(),
    });

    let exit = loop {
        tokio::select! {
            exit = process.wait() => break exit,
            Some(signal) = control.recv() => {
                if let Err(e) = process.signal(signal) {
                    tracing::warn!(child = %name, %signal, error = %e, "Failed to signal child");
                }
            }
        }
    };
    let event = match exit {
        Ok(exit) => ChildEvent::Exited { child: name, exit },
        Err(error) => ChildEvent::Lost { child: name, error },
    };
    let _ = events.send(event);
}
