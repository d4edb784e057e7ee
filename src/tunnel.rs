//! One supervised tunnel process.
//!
//! A `Tunnel` binds a token to a metrics port for its whole life. The
//! port is never renumbered in place; when a port must change the record
//! is destroyed and a fresh one created. Only the OS handle is replaced
//! on restart.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::SupervisorError;
use crate::runtime::{TunnelHandle, TunnelRuntime};
use crate::tokens::Token;

/// Lifecycle state of a tunnel record.
///
/// Spawning transitions straight to `Running` (the spawn call returning
/// is the only readiness signal). `Exited` is only ever observed
/// reactively via [`Tunnel::is_alive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Running,
    Exited,
    Terminated,
}

/// One tunnel process record.
pub struct Tunnel {
    token: Token,
    metrics_port: u16,
    handle: Option<Box<dyn TunnelHandle>>,
    state: TunnelState,
}

impl Tunnel {
    /// Spawn a fresh tunnel process for `token` on `metrics_port`.
    pub async fn spawn(
        runtime: &dyn TunnelRuntime,
        token: Token,
        metrics_port: u16,
    ) -> Result<Self, SupervisorError> {
        let handle = runtime.spawn(&token, metrics_port).await?;
        Ok(Self {
            token,
            metrics_port,
            handle: Some(handle),
            state: TunnelState::Running,
        })
    }

    /// A record whose spawn failed: it holds its token and port so the
    /// contiguous range stays intact, and is retried by the next reload
    /// or child-exit pass.
    pub fn unspawned(token: Token, metrics_port: u16) -> Self {
        Self {
            token,
            metrics_port,
            handle: None,
            state: TunnelState::Exited,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn metrics_port(&self) -> u16 {
        self.metrics_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    /// Whether this record currently owns an OS handle. False only for a
    /// record whose spawn failed and is awaiting retry.
    pub fn is_spawned(&self) -> bool {
        self.handle.is_some()
    }

    /// Non-blocking liveness check. Updates the record state when the
    /// process is found dead.
    pub fn is_alive(&mut self) -> bool {
        let alive = match self.handle.as_mut() {
            Some(handle) => handle.is_alive(),
            None => false,
        };
        if !alive && self.state == TunnelState::Running {
            self.state = TunnelState::Exited;
        }
        alive
    }

    /// Send the graceful stop signal without waiting.
    pub fn signal_stop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.signal_stop();
        }
    }

    /// Wait for exit until `deadline`; past it, kill without waiting.
    ///
    /// The deadline is shared across a batch so aggregate shutdown time
    /// is bounded by one grace period. The handle is released either way.
    pub async fn reap_by(&mut self, deadline: Instant) {
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout_at(deadline, handle.wait()).await.is_err() {
                debug!(
                    metrics_port = self.metrics_port,
                    "grace period elapsed, killing tunnel process"
                );
                handle.kill().await;
            }
        }
        self.state = TunnelState::Terminated;
    }

    /// Gracefully terminate this process: SIGTERM, bounded wait, SIGKILL
    /// fallback. Idempotent on an already-exited process.
    pub async fn terminate(&mut self, grace: Duration) {
        self.signal_stop();
        self.reap_by(Instant::now() + grace).await;
    }

    /// Replace the OS process after it died, reusing token and port.
    ///
    /// The caller must have confirmed the process is dead; restarting a
    /// live process is a supervisor bookkeeping bug.
    pub async fn restart(&mut self, runtime: &dyn TunnelRuntime) -> Result<(), SupervisorError> {
        assert!(
            !self.is_alive(),
            "restart of a tunnel whose process is still running"
        );
        self.handle = None;
        let handle = runtime.spawn(&self.token, self.metrics_port).await?;
        self.handle = Some(handle);
        self.state = TunnelState::Running;
        Ok(())
    }
}
