use anyhow::{Context, Result};
use tracing::{info, warn};

use courier_broker::ProxyBroker;
use courier_common::{config, BrokerConfig, KeyStore, WorkerConfig};
use courier_worker::{echo, WorkerUnit};

mod supervisor;

use supervisor::Supervisor;

/// Courier daemon: starts the broker and its workers as supervised units
/// and coordinates their shutdown on interrupt/terminate.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let broker_config = BrokerConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    let workers = config::worker_count_from_env();
    let keystore = KeyStore::from_env();

    if worker_config.encrypt != broker_config.backend.encrypt {
        warn!(
            backend = broker_config.backend.encrypt,
            worker = worker_config.encrypt,
            "worker and backend encryption flags disagree; handshakes will fail"
        );
    }

    // Startup failures are fatal before any unit runs: a broker that cannot
    // bind or configure its handshake exits non-zero with nothing started.
    let broker = ProxyBroker::new(broker_config, &keystore)
        .context("broker configuration failed")?
        .bind()
        .context("broker startup failed")?;

    info!(
        client_facing = %broker.frontend_addr(),
        worker_facing = %broker.backend_addr(),
        workers,
        "courier starting"
    );

    let mut sup = Supervisor::new();
    sup.install_signal_handler()?;

    sup.spawn("broker", move |token| broker.run(token))?;

    for i in 0..workers {
        let name = format!("worker-{i}");
        let unit = WorkerUnit::new(worker_config.clone(), &keystore, echo())
            .with_context(|| format!("{name} setup failed"))?;
        info!(unit = %name, identity = %unit.identity(), "worker prepared");
        sup.spawn(&name, move |token| unit.run(token))?;
    }

    sup.wait()
}
