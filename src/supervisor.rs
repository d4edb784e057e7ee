//! The top-level control loop.
//!
//! Purely signal-reactive: the supervisor builds the initial fleet once,
//! then blocks for signals and dispatches. It never polls. Whatever way
//! the loop exits, the remaining fleet is shut down before returning.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::SupervisorError;
use crate::fleet::{Fleet, FleetConfig};
use crate::runtime::TunnelRuntime;
use crate::signals::{SignalHandler, Wake};
use crate::tokens::TokenSource;

/// The supervisor: owns the fleet and the token source.
pub struct Supervisor {
    source: Box<dyn TokenSource>,
    fleet: Fleet,
}

impl Supervisor {
    pub fn new(
        source: Box<dyn TokenSource>,
        runtime: Arc<dyn TunnelRuntime>,
        config: FleetConfig,
    ) -> Self {
        Self {
            source,
            fleet: Fleet::new(runtime, config),
        }
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Build the initial fleet and react to signals until terminated.
    ///
    /// The batch shutdown runs on every exit path, including error
    /// propagation out of startup or the loop itself.
    pub async fn run(&mut self, signals: &mut SignalHandler) -> Result<(), SupervisorError> {
        let result = self.serve(signals).await;
        self.fleet.shutdown_all().await;
        result
    }

    /// Fetch the initial token list and build the fleet. Fetch or spawn
    /// failure here is fatal to the whole program.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let tokens = self.source.fetch().await?;
        info!(count = tokens.len(), "starting tunnel fleet");
        self.fleet.build(&tokens).await
    }

    async fn serve(&mut self, signals: &mut SignalHandler) -> Result<(), SupervisorError> {
        self.start().await?;

        loop {
            match signals.wait().await {
                Wake::Terminate => {
                    info!("termination requested");
                    return Ok(());
                }
                Wake::ChildExit => self.handle_child_exit().await,
                Wake::Reload => self.reload().await,
            }
        }
    }

    /// One pass over all records; every dead process is restarted.
    pub async fn handle_child_exit(&mut self) {
        self.fleet.restart_dead().await;
    }

    /// Fetch a fresh token list and reconcile. A failed fetch leaves the
    /// fleet untouched and is not fatal.
    pub async fn reload(&mut self) {
        info!("reloading tunnel tokens");
        match self.source.fetch().await {
            Ok(tokens) => self.fleet.reconcile(&tokens).await,
            Err(e) => error!(error = %e, "token reload failed, keeping current fleet"),
        }
    }
}
