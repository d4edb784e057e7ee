//! Signal handling for the control loop.
//!
//! Signals are folded into typed wake-up reasons consumed synchronously
//! by the one thread that owns the fleet; no handler ever mutates shared
//! state. Delivery is coalescing: one wake-up may stand for several
//! signals of the same kind.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Why the control loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Terminate the supervisor (SIGTERM or SIGINT).
    Terminate,
    /// At least one child may have exited (SIGCHLD).
    ChildExit,
    /// Re-fetch the token list and reconcile (SIGHUP).
    Reload,
}

/// Listens for the three signals the supervisor reacts to.
pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sigchld: Signal,
    sighup: Signal,
}

impl SignalHandler {
    /// Install the signal listeners. Failure here aborts startup.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigchld: signal(SignalKind::child())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Block until the next signal arrives.
    pub async fn wait(&mut self) -> Wake {
        tokio::select! {
            _ = self.sigterm.recv() => Wake::Terminate,
            _ = self.sigint.recv() => Wake::Terminate,
            _ = self.sigchld.recv() => Wake::ChildExit,
            _ = self.sighup.recv() => Wake::Reload,
        }
    }
}
