//! Configuration for the supervisor.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// First metrics port handed out; tunnels occupy a contiguous range
/// starting here.
pub const METRICS_PORT_BASE: u16 = 15300;

/// How long a child gets between SIGTERM and SIGKILL.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Uid/gid of the unprivileged snap daemon user.
pub const DAEMON_UID: u32 = 584792;
pub const DAEMON_GID: u32 = 584792;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the cloudflared binary.
    pub cloudflared_path: PathBuf,

    /// Control-plane key holding the comma-separated token list.
    pub tokens_key: String,

    /// Pid file written at startup and removed on exit.
    pub pid_file: PathBuf,

    /// Identity the supervisor drops to before spawning children.
    pub run_uid: u32,
    pub run_gid: u32,

    /// First metrics port in the contiguous range.
    pub metrics_port_base: u16,

    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
}

impl Config {
    /// Load configuration from the snap environment.
    pub fn from_env() -> Result<Self> {
        let snap = std::env::var("SNAP").context("SNAP environment variable not set")?;
        let snap_common =
            std::env::var("SNAP_COMMON").context("SNAP_COMMON environment variable not set")?;

        let cloudflared_path = PathBuf::from(snap).join("usr/bin/cloudflared");
        let pid_file = PathBuf::from(snap_common).join("run").join("services.pid");

        Ok(Self {
            cloudflared_path,
            tokens_key: "tokens".to_string(),
            pid_file,
            run_uid: DAEMON_UID,
            run_gid: DAEMON_GID,
            metrics_port_base: METRICS_PORT_BASE,
            grace: TERMINATION_GRACE,
        })
    }
}
