//! Handles to launched processes.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use berth_common::{LaunchError, LaunchResult, Signal};
use tokio::process::Child;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl ProcessExit {
    /// Whether the process exited with status 0.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Shell-style exit code: the status, or 128 plus the signal number.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Exited(1),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(raw) => match Signal::from_raw(*raw) {
                Some(signal) => write!(f, "killed by {signal}"),
                None => write!(f, "killed by signal {raw}"),
            },
        }
    }
}

/// A running process started by a launcher.
#[derive(Debug)]
pub struct Process {
    child: Child,
    pid: u32,
    program: String,
    group_leader: bool,
}

impl Process {
    pub(crate) fn new(child: Child, program: &str, group_leader: bool) -> LaunchResult<Self> {
        let pid = child.id().ok_or_else(|| LaunchError::Spawn {
            program: program.to_string(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;
        Ok(Self {
            child,
            pid,
            program: program.to_string(),
            group_leader,
        })
    }

    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Program that was launched.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> LaunchResult<ProcessExit> {
        let status = self.child.wait().await.map_err(|source| LaunchError::Wait {
            pid: self.pid,
            source,
        })?;
        Ok(status.into())
    }

    /// Send a signal to the process, or to its whole group if it leads one.
    ///
    /// Signalling a process that has already been reaped is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the signal.
    pub fn signal(&self, signal: Signal) -> LaunchResult<()> {
        // `id()` is cleared once the child is reaped, so the pid cannot have been reused.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
            return Ok(());
        };

        #[allow(unsafe_code)]
        let ret = unsafe {
            if self.group_leader {
                libc::killpg(raw_pid, signal.as_raw())
            } else {
                libc::kill(raw_pid, signal.as_raw())
            }
        };
        if ret == 0 {
            tracing::debug!(pid, %signal, group = self.group_leader, "Sent signal");
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(LaunchError::Signal {
            pid,
            signal: signal.to_string(),
            source: err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert!(ProcessExit::Exited(0).success());
        assert!(!ProcessExit::Exited(3).success());
        assert_eq!(ProcessExit::Exited(3).code(), 3);
        assert_eq!(ProcessExit::Signaled(9).code(), 137);
        assert!(!ProcessExit::Signaled(15).success());
    }

    #[test]
    fn display() {
        assert_eq!(ProcessExit::Exited(2).to_string(), "exit code 2");
        assert_eq!(ProcessExit::Signaled(15).to_string(), "killed by SIGTERM");
        assert_eq!(ProcessExit::Signaled(99).to_string(), "killed by signal 99");
    }

    #[test]
    fn from_status() {
        assert_eq!(
            ProcessExit::from(ExitStatus::from_raw(3 << 8)),
            ProcessExit::Exited(3)
        );
        assert_eq!(
            ProcessExit::from(ExitStatus::from_raw(9)),
            ProcessExit::Signaled(9)
        );
    }
}
