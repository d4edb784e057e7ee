//! Tunnel runtime interface, real implementation, and mock.
//!
//! The runtime abstracts process lifecycle operations:
//! - Spawning a cloudflared process for a token and metrics port
//! - Liveness checks, graceful stop, forceful kill
//!
//! A mock implementation is provided for testing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::Config;
use crate::error::SupervisorError;
use crate::tokens::Token;

/// Exclusive handle to one running tunnel process.
#[async_trait]
pub trait TunnelHandle: Send {
    /// OS pid, if the process has not been reaped yet.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Send the graceful stop signal. No-op once the process exited.
    fn signal_stop(&mut self);

    /// Wait for the process to exit.
    async fn wait(&mut self);

    /// Forcefully kill the process and reap it.
    async fn kill(&mut self);
}

/// Tunnel runtime interface.
#[async_trait]
pub trait TunnelRuntime: Send + Sync {
    /// Spawn a tunnel process bound to the given token and metrics port.
    async fn spawn(
        &self,
        token: &Token,
        metrics_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, SupervisorError>;
}

/// Production runtime spawning the real cloudflared binary.
pub struct ProcessRuntime {
    binary: PathBuf,
}

impl ProcessRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.cloudflared_path.clone(),
        }
    }
}

#[async_trait]
impl TunnelRuntime for ProcessRuntime {
    async fn spawn(
        &self,
        token: &Token,
        metrics_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, SupervisorError> {
        // The token travels via the environment, never argv, so it does
        // not show up in process listings.
        let child = Command::new(&self.binary)
            .arg("tunnel")
            .arg("--no-autoupdate")
            .arg("--metrics")
            .arg(format!("127.0.0.1:{metrics_port}"))
            .arg("--protocol")
            .arg("http2")
            .arg("run")
            .env_clear()
            .env("TUNNEL_TOKEN", token.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::SpawnFailure)?;

        debug!(pid = child.id(), metrics_port, "spawned cloudflared");
        Ok(Box::new(ProcessHandle { child }))
    }
}

/// Handle over a real OS child.
struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl TunnelHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn signal_stop(&mut self) {
        // id() is None once the child has been reaped.
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    async fn wait(&mut self) {
        let _ = self.child.wait().await;
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Mock runtime for tests.
///
/// Records every spawn and kill, and lets tests flip processes to
/// "exited" to simulate crashes.
pub struct MockRuntime {
    inner: Arc<Mutex<MockInner>>,
    /// Mock processes ignore the graceful stop signal, so a batch
    /// shutdown has to fall back to the kill path.
    ignore_stop: bool,
    /// All spawns fail.
    fail_spawns: bool,
    /// Tokens whose spawns fail until allowed again.
    denied: Mutex<std::collections::HashSet<String>>,
}

#[derive(Default)]
struct MockInner {
    next_pid: u32,
    procs: Vec<Arc<MockProcess>>,
    kill_log: Vec<u32>,
    spawn_count: usize,
}

/// One simulated process.
struct MockProcess {
    pid: u32,
    token: Token,
    metrics_port: u16,
    ignore_stop: bool,
    exited: AtomicBool,
    exit_notify: Notify,
}

impl MockProcess {
    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit_notify.notify_waiters();
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            ignore_stop: false,
            fail_spawns: false,
            denied: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Make spawns for `token` fail until [`MockRuntime::allow`].
    pub fn deny(&self, token: &Token) {
        self.denied.lock().unwrap().insert(token.as_str().to_string());
    }

    /// Let spawns for `token` succeed again.
    pub fn allow(&self, token: &Token) {
        self.denied.lock().unwrap().remove(token.as_str());
    }

    /// A runtime whose processes ignore SIGTERM and only die on kill.
    pub fn stubborn() -> Self {
        Self {
            ignore_stop: true,
            ..Self::new()
        }
    }

    /// A runtime that fails every spawn.
    pub fn failing() -> Self {
        Self {
            fail_spawns: true,
            ..Self::new()
        }
    }

    /// Total number of spawn calls that succeeded.
    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().spawn_count
    }

    /// Pids forcefully killed so far.
    pub fn kill_count(&self) -> usize {
        self.inner.lock().unwrap().kill_log.len()
    }

    /// Live (token, metrics_port) pairs, sorted by port.
    pub fn running(&self) -> Vec<(Token, u16)> {
        let inner = self.inner.lock().unwrap();
        let mut live: Vec<(Token, u16)> = inner
            .procs
            .iter()
            .filter(|p| p.is_alive())
            .map(|p| (p.token.clone(), p.metrics_port))
            .collect();
        live.sort_by_key(|(_, port)| *port);
        live
    }

    /// Ports of live processes, sorted.
    pub fn live_ports(&self) -> Vec<u16> {
        self.running().into_iter().map(|(_, port)| port).collect()
    }

    /// Number of live processes holding the given token.
    pub fn live_count_for(&self, token: &Token) -> usize {
        self.running().iter().filter(|(t, _)| t == token).count()
    }

    /// Simulate a crash of every live process holding the given token.
    pub fn crash(&self, token: &Token) {
        let inner = self.inner.lock().unwrap();
        for proc in inner.procs.iter().filter(|p| p.is_alive()) {
            if &proc.token == token {
                proc.mark_exited();
            }
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelRuntime for MockRuntime {
    async fn spawn(
        &self,
        token: &Token,
        metrics_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, SupervisorError> {
        if self.fail_spawns || self.denied.lock().unwrap().contains(token.as_str()) {
            return Err(SupervisorError::SpawnFailure(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock spawn failure",
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.next_pid += 1;
        inner.spawn_count += 1;
        let proc = Arc::new(MockProcess {
            pid: inner.next_pid,
            token: token.clone(),
            metrics_port,
            ignore_stop: self.ignore_stop,
            exited: AtomicBool::new(false),
            exit_notify: Notify::new(),
        });
        inner.procs.push(Arc::clone(&proc));

        Ok(Box::new(MockHandle {
            proc,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockHandle {
    proc: Arc<MockProcess>,
    inner: Arc<Mutex<MockInner>>,
}

#[async_trait]
impl TunnelHandle for MockHandle {
    fn pid(&self) -> Option<u32> {
        self.proc.is_alive().then_some(self.proc.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.proc.is_alive()
    }

    fn signal_stop(&mut self) {
        if !self.proc.ignore_stop {
            self.proc.mark_exited();
        }
    }

    async fn wait(&mut self) {
        loop {
            let notified = self.proc.exit_notify.notified();
            if !self.proc.is_alive() {
                return;
            }
            notified.await;
        }
    }

    async fn kill(&mut self) {
        if self.proc.is_alive() {
            self.proc.mark_exited();
            self.inner.lock().unwrap().kill_log.push(self.proc.pid);
        }
    }
}
