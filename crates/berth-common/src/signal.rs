//! Signals berth delivers to processes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A signal berth knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Hangup.
    Hup,
    /// Interrupt (Ctrl-C).
    Int,
    /// Quit.
    Quit,
    /// Forced kill, cannot be caught.
    Kill,
    /// Graceful termination request.
    Term,
    /// User-defined signal 1.
    Usr1,
    /// User-defined signal 2.
    Usr2,
}

impl Signal {
    /// Raw signal number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Kill => libc::SIGKILL,
            Self::Term => libc::SIGTERM,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Look up a signal by number.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            libc::SIGHUP => Some(Self::Hup),
            libc::SIGINT => Some(Self::Int),
            libc::SIGQUIT => Some(Self::Quit),
            libc::SIGKILL => Some(Self::Kill),
            libc::SIGTERM => Some(Self::Term),
            libc::SIGUSR1 => Some(Self::Usr1),
            libc::SIGUSR2 => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Kill => "SIGKILL",
            Self::Term => "SIGTERM",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "HUP" => Ok(Self::Hup),
            "INT" => Ok(Self::Int),
            "QUIT" => Ok(Self::Quit),
            "KILL" => Ok(Self::Kill),
            "TERM" => Ok(Self::Term),
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            _ => Err(format!("unknown signal: {s}")),
        }
    }
}
