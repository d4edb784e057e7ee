//! cloudflared-supervisor
//!
//! Supervises one long-lived `cloudflared` tunnel process per configured
//! token. The desired token list comes from the snap control plane; the
//! supervisor converges the running process set to match it, restarts
//! children that die, and tears everything down promptly on termination.
//!
//! ## Architecture
//!
//! - **Supervisor**: signal-driven control loop (terminate / child exit /
//!   reload), the single owner of the fleet
//! - **Fleet**: the process set and its reconciliation against the
//!   desired token list, keeping metrics ports contiguous
//! - **Tunnel**: one child process bound to one token and one metrics port
//! - **TunnelRuntime**: abstracts process lifecycle operations (real
//!   `cloudflared` in production, mock in tests)

pub mod config;
pub mod error;
pub mod fleet;
pub mod pidfile;
pub mod privdrop;
pub mod runtime;
pub mod signals;
pub mod snapctl;
pub mod supervisor;
pub mod tokens;
pub mod tunnel;

// Re-export commonly used types
pub use config::Config;
pub use error::SupervisorError;
pub use fleet::{Fleet, FleetConfig};
pub use runtime::{MockRuntime, ProcessRuntime, TunnelRuntime};
pub use supervisor::Supervisor;
pub use tokens::{Token, TokenSource};
