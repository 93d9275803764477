//! Signals delivered to berth itself.

use berth_common::Signal;
use tokio::signal::unix::{SignalKind, signal};

/// Stream of `SIGINT`, `SIGTERM` and `SIGHUP` received by this process.
#[derive(Debug)]
pub struct ExternalSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl ExternalSignals {
    /// Start listening. From now on these signals no longer kill berth.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be installed.
    pub fn listen() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Int,
            _ = self.terminate.recv() => Signal::Term,
            _ = self.hangup.recv() => Signal::Hup,
        }
    }
}
