//! cloudflared-supervisor entrypoint.
//!
//! Startup order matters: the pid-file directory is prepared while still
//! privileged, privileges drop before anything is spawned, and the
//! signal handler is installed before the first child so no exit is
//! missed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cloudflared_supervisor::config::Config;
use cloudflared_supervisor::fleet::FleetConfig;
use cloudflared_supervisor::pidfile::{self, PidFile};
use cloudflared_supervisor::privdrop;
use cloudflared_supervisor::runtime::ProcessRuntime;
use cloudflared_supervisor::signals::SignalHandler;
use cloudflared_supervisor::supervisor::Supervisor;
use cloudflared_supervisor::tokens::SnapctlTokenSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting cloudflared supervisor");

    let config = Config::from_env()?;

    pidfile::prepare_runtime_dir(&config.pid_file, config.run_uid, config.run_gid)
        .context("failed to prepare pid-file directory")?;
    privdrop::drop_privileges(config.run_uid, config.run_gid)
        .context("failed to drop privileges")?;

    let mut signals = SignalHandler::new().context("failed to install signal handlers")?;
    let _pid_file =
        PidFile::create(&config.pid_file).context("failed to write pid file")?;

    let runtime = Arc::new(ProcessRuntime::new(&config));
    let source = Box::new(SnapctlTokenSource::new(config.tokens_key.clone()));
    let fleet_config = FleetConfig {
        base_port: config.metrics_port_base,
        grace: config.grace,
    };

    let mut supervisor = Supervisor::new(source, runtime, fleet_config);
    supervisor.run(&mut signals).await?;

    info!("supervisor shutdown complete");
    Ok(())
}
