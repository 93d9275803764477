//! Lifecycle of a supervised child.

use std::fmt;

use berth_common::Signal;
use berth_sandbox::ProcessExit;

/// Where a child is in its lifecycle.
///
/// ```text
/// Pending -> Starting -> Running -> Exited | Killed | Lost
///               |
///               +-> FailedToStart | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Not yet picked up.
    Pending,
    /// Image build, volume init and spawn in progress.
    Starting,
    /// Process is alive.
    Running {
        /// Process id.
        pid: u32,
    },
    /// Process exited with a status code.
    Exited(i32),
    /// Process was terminated by a signal.
    Killed(i32),
    /// Waiting for the process failed; its fate is unknown.
    Lost,
    /// Preparing or spawning the process failed.
    FailedToStart,
    /// The group stopped before the child was started.
    Cancelled,
}

impl ChildState {
    /// Whether the child will not change state any more.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Exited(_)
                | Self::Killed(_)
                | Self::Lost
                | Self::FailedToStart
                | Self::Cancelled
        )
    }

    /// Whether a process is alive.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Shell-style exit code of a finished process.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Killed(signal) => Some(128 + signal),
            _ => None,
        }
    }

    /// Move to `next` if the transition is allowed.
    ///
    /// Returns `false` and leaves the state unchanged otherwise.
    pub fn advance(&mut self, next: Self) -> bool {
        let allowed = match (*self, next) {
            (Self::Pending, Self::Starting | Self::Cancelled) => true,
            (Self::Starting, Self::Running { .. } | Self::FailedToStart | Self::Cancelled) => true,
            (Self::Running { .. }, Self::Exited(_) | Self::Killed(_) | Self::Lost) => true,
            _ => false,
        };
        if allowed {
            *self = next;
        }
        allowed
    }
}

impl From<ProcessExit> for ChildState {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Exited(code) => Self::Exited(code),
            ProcessExit::Signaled(signal) => Self::Killed(signal),
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Starting => f.write_str("starting"),
            Self::Running { pid } => write!(f, "running (pid {pid})"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Killed(raw) => match Signal::from_raw(*raw) {
                Some(signal) => write!(f, "killed by {signal}"),
                None => write!(f, "killed by signal {raw}"),
            },
            Self::Lost => f.write_str("lost (wait failed)"),
            Self::FailedToStart => f.write_str("failed to start"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut state = ChildState::Pending;
        assert!(state.advance(ChildState::Starting));
        assert!(state.advance(ChildState::Running { pid: 42 }));
        assert!(state.is_running());
        assert!(state.advance(ProcessExit::Signaled(15).into()));
        assert_eq!(state, ChildState::Killed(15));
        assert!(state.is_terminal());
        assert_eq!(state.code(), Some(143));
    }

    #[test]
    fn rejected_transitions() {
        let mut state = ChildState::Pending;
        assert!(!state.advance(ChildState::Running { pid: 1 }));
        assert_eq!(state, ChildState::Pending);

        let mut state = ChildState::Exited(0);
        assert!(!state.advance(ChildState::Starting));
        assert!(!state.advance(ChildState::Killed(9)));
        assert_eq!(state, ChildState::Exited(0));
    }

    #[test]
    fn cancelled_before_start() {
        let mut state = ChildState::Starting;
        assert!(state.advance(ChildState::Cancelled));
        assert!(state.is_terminal());
        assert_eq!(state.code(), None);
    }

    #[test]
    fn lost_has_no_code() {
        let mut state = ChildState::Running { pid: 42 };
        assert!(state.advance(ChildState::Lost));
        assert!(state.is_terminal());
        assert_eq!(state.code(), None);
        assert!(!state.advance(ChildState::Exited(0)));

        let mut state = ChildState::Starting;
        assert!(!state.advance(ChildState::Lost));
    }

    #[test]
    fn display() {
        assert_eq!(ChildState::Exited(1).to_string(), "exited with code 1");
        assert_eq!(ChildState::Killed(9).to_string(), "killed by SIGKILL");
        assert_eq!(ChildState::Lost.to_string(), "lost (wait failed)");
        assert_eq!(
            ChildState::Running { pid: 7 }.to_string(),
            "running (pid 7)"
        );
    }
}
