use anyhow::{Context, Result};
use tracing::{error, info};

use courier_common::{KeyStore, ShutdownToken, WorkerConfig};
use courier_worker::{echo, WorkerUnit};

/// Standalone worker with the pass-through handler.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    let keystore = KeyStore::from_env();

    let unit = WorkerUnit::new(config, &keystore, echo()).context("worker setup failed")?;
    info!(identity = %unit.identity(), "courier worker starting");

    let shutdown = ShutdownToken::new();
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || signal_token.trigger())
        .context("failed to install signal handler")?;

    if let Err(e) = unit.run(shutdown) {
        error!(%e, "worker terminated");
        return Err(e.into());
    }
    Ok(())
}
