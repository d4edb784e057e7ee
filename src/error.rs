//! Supervisor errors.

use thiserror::Error;

/// Errors surfaced by the supervisor core.
///
/// Internal invariant violations (restarting a process that is still
/// running, exhausting the contiguous port range) are programming errors
/// and assert instead of appearing here.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The control plane could not be read or returned unusable data.
    ///
    /// Recovered locally: a reload that fails to fetch leaves the
    /// existing fleet untouched.
    #[error("control plane unavailable: {0}")]
    ConfigUnavailable(String),

    /// The cloudflared binary could not be launched.
    ///
    /// Fatal during initial fleet construction; during a later
    /// reconciliation the token is retried on the next reload or
    /// child-exit pass.
    #[error("failed to spawn tunnel process: {0}")]
    SpawnFailure(#[source] std::io::Error),
}
