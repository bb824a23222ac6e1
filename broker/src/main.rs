use anyhow::{Context, Result};
use tracing::{error, info};

use courier_broker::ProxyBroker;
use courier_common::{BrokerConfig, KeyStore, ShutdownToken};

/// Standalone broker: binds both endpoints from the environment
/// configuration and relays until interrupted.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = BrokerConfig::from_env();
    let keystore = KeyStore::from_env();

    let broker = ProxyBroker::new(config, &keystore)
        .context("broker configuration failed")?
        .bind()
        .context("broker startup failed")?;

    info!(
        client_facing = %broker.frontend_addr(),
        worker_facing = %broker.backend_addr(),
        "courier broker ready"
    );

    let shutdown = ShutdownToken::new();
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || signal_token.trigger())
        .context("failed to install signal handler")?;

    if let Err(e) = broker.run(shutdown) {
        error!(%e, "broker terminated");
        return Err(e.into());
    }
    Ok(())
}
