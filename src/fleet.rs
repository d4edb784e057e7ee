//! The supervised process set and its reconciliation.
//!
//! The fleet keeps one tunnel process per desired token, with metrics
//! ports forming the contiguous range `[base, base + N)`. Reconciliation
//! maps a fresh desired token list onto the minimal set of destroy and
//! create operations that re-establishes that invariant.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{METRICS_PORT_BASE, TERMINATION_GRACE};
use crate::error::SupervisorError;
use crate::runtime::TunnelRuntime;
use crate::tokens::Token;
use crate::tunnel::Tunnel;

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// First port of the contiguous metrics range.
    pub base_port: u16,

    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            base_port: METRICS_PORT_BASE,
            grace: TERMINATION_GRACE,
        }
    }
}

/// The set of supervised tunnel processes.
///
/// Owned and mutated exclusively by the supervisor's control loop; no
/// operation here runs concurrently with another fleet operation.
pub struct Fleet {
    runtime: Arc<dyn TunnelRuntime>,
    config: FleetConfig,
    tunnels: Vec<Tunnel>,
}

impl Fleet {
    pub fn new(runtime: Arc<dyn TunnelRuntime>, config: FleetConfig) -> Self {
        Self {
            runtime,
            config,
            tunnels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Metrics ports currently held by records, sorted.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tunnels.iter().map(Tunnel::metrics_port).collect();
        ports.sort_unstable();
        ports
    }

    /// The (token, port) pair held for `token`, if any.
    pub fn port_of(&self, token: &Token) -> Option<u16> {
        self.tunnels
            .iter()
            .find(|t| t.token() == token)
            .map(Tunnel::metrics_port)
    }

    /// Build the initial fleet: one process per token, ports assigned
    /// `base, base+1, ...` in fetch order. Any spawn failure here is
    /// fatal; the supervisor must not silently run with a gap.
    pub async fn build(&mut self, tokens: &[Token]) -> Result<(), SupervisorError> {
        debug_assert!(self.tunnels.is_empty(), "fleet built twice");
        if port_range_end(self.config.base_port, tokens.len()).is_none() {
            return Err(SupervisorError::ConfigUnavailable(format!(
                "{} tokens do not fit the metrics port space above {}",
                tokens.len(),
                self.config.base_port
            )));
        }
        for (i, token) in tokens.iter().enumerate() {
            let port = self.config.base_port + i as u16;
            let tunnel = Tunnel::spawn(self.runtime.as_ref(), token.clone(), port).await?;
            info!(
                metrics_port = port,
                token = %token.redacted(),
                pid = tunnel.pid(),
                "started tunnel"
            );
            self.tunnels.push(tunnel);
        }
        Ok(())
    }

    /// Converge the fleet onto `desired`.
    ///
    /// - Equal as unordered sets: complete no-op, nothing restarts.
    /// - Records whose token disappeared are destroyed.
    /// - Records whose port falls outside `[base, base + len(desired))`
    ///   are destroyed and their token re-queued for a fresh record, so
    ///   ports never drift into a sparse set as tokens churn.
    /// - All destructions complete (one shared grace period) before any
    ///   creation, so a token never has two live processes.
    /// - New records get the lowest free port in range, first-fit.
    pub async fn reconcile(&mut self, desired: &[Token]) {
        let current: HashSet<&Token> = self.tunnels.iter().map(Tunnel::token).collect();
        let desired_set: HashSet<&Token> = desired.iter().collect();

        if current == desired_set {
            // An unchanged token list is a no-op for settled records, but
            // a record whose spawn failed earlier still gets its retry
            // here; a dead fleet may never see another SIGCHLD.
            debug!("token set unchanged, nothing to reconcile");
            respawn_missing(self.runtime.as_ref(), &mut self.tunnels).await;
            return;
        }

        let Some(port_limit) = port_range_end(self.config.base_port, desired.len()) else {
            warn!(
                count = desired.len(),
                base_port = self.config.base_port,
                "token list does not fit the metrics port space, keeping current fleet"
            );
            return;
        };

        // Tokens that need a fresh record: newly desired ones first, then
        // survivors evicted from out-of-range ports.
        let mut pending: Vec<Token> = desired
            .iter()
            .filter(|t| !current.contains(*t))
            .cloned()
            .collect();

        let mut doomed: Vec<Tunnel> = Vec::new();
        let mut kept: Vec<Tunnel> = Vec::new();
        for tunnel in self.tunnels.drain(..) {
            if !desired_set.contains(tunnel.token()) {
                doomed.push(tunnel);
            } else if tunnel.metrics_port() >= port_limit {
                pending.push(tunnel.token().clone());
                doomed.push(tunnel);
            } else {
                kept.push(tunnel);
            }
        }

        info!(
            removing = doomed.len(),
            keeping = kept.len(),
            creating = pending.len(),
            "reconciling tunnel fleet"
        );

        shutdown_batch(&mut doomed, self.config.grace).await;

        // Survivors that never managed to spawn get another attempt, after
        // all destructions and before any new record, like every creation.
        respawn_missing(self.runtime.as_ref(), &mut kept).await;

        let mut used: BTreeSet<u16> = kept.iter().map(Tunnel::metrics_port).collect();
        for token in pending {
            let port = (self.config.base_port..port_limit)
                .find(|p| !used.contains(p))
                .expect("no free port left in the contiguous range");
            used.insert(port);

            match Tunnel::spawn(self.runtime.as_ref(), token.clone(), port).await {
                Ok(tunnel) => {
                    info!(
                        metrics_port = port,
                        token = %token.redacted(),
                        pid = tunnel.pid(),
                        "started tunnel"
                    );
                    kept.push(tunnel);
                }
                Err(e) => {
                    // Partial failure: keep the record so the port stays
                    // reserved and the token is retried on the next pass.
                    warn!(
                        metrics_port = port,
                        token = %token.redacted(),
                        error = %e,
                        "failed to start tunnel, will retry"
                    );
                    kept.push(Tunnel::unspawned(token, port));
                }
            }
        }

        self.tunnels = kept;
    }

    /// Restart every record whose process is no longer alive.
    ///
    /// A single child-exit notification may correspond to several exits,
    /// or to none (coalesced delivery), so all records are checked in one
    /// pass rather than assuming exactly one death.
    pub async fn restart_dead(&mut self) {
        for tunnel in &mut self.tunnels {
            if tunnel.is_alive() {
                continue;
            }
            info!(
                metrics_port = tunnel.metrics_port(),
                token = %tunnel.token().redacted(),
                "restarting dead tunnel"
            );
            if let Err(e) = tunnel.restart(self.runtime.as_ref()).await {
                warn!(
                    metrics_port = tunnel.metrics_port(),
                    error = %e,
                    "failed to restart tunnel, will retry"
                );
            }
        }
    }

    /// Destroy every record under the batch shutdown protocol.
    pub async fn shutdown_all(&mut self) {
        let mut doomed = std::mem::take(&mut self.tunnels);
        shutdown_batch(&mut doomed, self.config.grace).await;
    }
}

/// End of the contiguous port range for `count` tokens, if it fits in
/// the u16 port space.
fn port_range_end(base: u16, count: usize) -> Option<u16> {
    u16::try_from(count)
        .ok()
        .and_then(|n| base.checked_add(n))
}

/// Retry the spawn of every record that has no OS handle.
///
/// Such records only exist after a reconcile-time spawn failure; their
/// token and port are kept so nothing else moves.
async fn respawn_missing(runtime: &dyn TunnelRuntime, tunnels: &mut [Tunnel]) {
    for tunnel in tunnels {
        if tunnel.is_spawned() {
            continue;
        }
        info!(
            metrics_port = tunnel.metrics_port(),
            token = %tunnel.token().redacted(),
            "retrying tunnel spawn"
        );
        if let Err(e) = tunnel.restart(runtime).await {
            warn!(
                metrics_port = tunnel.metrics_port(),
                error = %e,
                "failed to start tunnel, will retry"
            );
        }
    }
}

/// Batch graceful shutdown: signal every process immediately, then wait
/// per record against one shared absolute deadline. A record still alive
/// once the deadline passes is killed without further waiting, bounding
/// total latency to roughly one grace period regardless of batch size.
async fn shutdown_batch(batch: &mut [Tunnel], grace: Duration) {
    if batch.is_empty() {
        return;
    }

    let pids: Vec<u32> = batch.iter().filter_map(Tunnel::pid).collect();
    info!(count = batch.len(), ?pids, "shutting down tunnel processes");

    for tunnel in batch.iter_mut() {
        tunnel.signal_stop();
    }

    let deadline = Instant::now() + grace;
    for tunnel in batch.iter_mut() {
        tunnel.reap_by(deadline).await;
    }
}
