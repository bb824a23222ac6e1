//! Courier relay broker.
//!
//! The broker binds two endpoints, one facing clients and one facing
//! workers, and forwards multipart messages between them without
//! interpreting a single payload frame. Each endpoint carries its own security posture:
//! encryption on or off, and an optional authorized-key gate on top of
//! encryption.
//!
//! Lifecycle: [`ProxyBroker::new`] validates configuration and prepares the
//! security material without touching a socket, [`ProxyBroker::bind`]
//! produces a [`BoundBroker`] with both listeners live (or neither), and
//! [`BoundBroker::run`] relays until shutdown is requested or the transport
//! fails underneath it. The broker never restarts itself.

use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{error, info, warn};

use courier_common::{
    access::{AccessGate, AuthorizedKeys, PermitAll},
    config::{BrokerConfig, EndpointConfig, BACKEND_ROLE, FRONTEND_ROLE},
    secure::{self, ServerTlsConfig},
    wire::Delivery,
    Error, KeyStore, Result, ShutdownToken, TransportError,
};

mod conn;

pub use conn::BrokerStatus;

use conn::{ClientRegistry, ConnId, WorkerPool, POLL_INTERVAL};

/// Security material resolved for one endpoint.
struct Side {
    tls: Option<ServerTlsConfig>,
    gate: Arc<dyn AccessGate>,
}

fn prepare_side(
    label: &str,
    role: &str,
    cfg: &EndpointConfig,
    keystore: &KeyStore,
) -> Result<Side> {
    if cfg.access_control && !cfg.encrypt {
        return Err(Error::Config(format!(
            "{label} endpoint enables access control without encryption; \
             authentication over a plaintext link verifies nothing"
        )));
    }

    let gate: Arc<dyn AccessGate> = if cfg.access_control {
        Arc::new(
            AuthorizedKeys::configure("*", keystore.authorized_dir())
                .deny_addresses(cfg.deny.clone()),
        )
    } else {
        Arc::new(PermitAll)
    };
    gate.start()?;

    let tls = if cfg.encrypt {
        let keypair = keystore.load_or_create(role)?;
        info!(endpoint = label, key = %keypair.public_key(), "encryption enabled");
        Some(secure::server_config(
            &keypair,
            cfg.access_control.then(|| gate.clone()),
        )?)
    } else {
        None
    };

    Ok(Side { tls, gate })
}

/// A configured broker that has not touched the network yet.
pub struct ProxyBroker {
    config: BrokerConfig,
    frontend: Side,
    backend: Side,
}

impl ProxyBroker {
    /// Validates the configuration and resolves keys and gates for both
    /// endpoints. Fails without binding anything.
    pub fn new(config: BrokerConfig, keystore: &KeyStore) -> Result<Self> {
        let frontend = prepare_side("client-facing", FRONTEND_ROLE, &config.frontend, keystore)?;
        let backend = prepare_side("worker-facing", BACKEND_ROLE, &config.backend, keystore)?;
        Ok(Self {
            config,
            frontend,
            backend,
        })
    }

    /// Binds both endpoints. On any failure neither listener survives.
    pub fn bind(self) -> Result<BoundBroker> {
        let bind = |cfg: &EndpointConfig| -> Result<TcpListener> {
            let addr = cfg.endpoint.addr();
            TcpListener::bind(&addr).map_err(|source| Error::Bind { addr, source })
        };

        let frontend_listener = bind(&self.config.frontend)?;
        let backend_listener = bind(&self.config.backend)?;

        let frontend_addr = frontend_listener
            .local_addr()
            .map_err(|source| Error::Bind {
                addr: self.config.frontend.endpoint.addr(),
                source,
            })?;
        let backend_addr = backend_listener.local_addr().map_err(|source| Error::Bind {
            addr: self.config.backend.endpoint.addr(),
            source,
        })?;

        info!(client_facing = %frontend_addr, worker_facing = %backend_addr, "broker bound");

        Ok(BoundBroker {
            frontend_listener,
            backend_listener,
            frontend_addr,
            backend_addr,
            frontend: self.frontend,
            backend: self.backend,
            status: BrokerStatus::default(),
        })
    }
}

/// A broker with both endpoints bound, ready to relay.
pub struct BoundBroker {
    frontend_listener: TcpListener,
    backend_listener: TcpListener,
    frontend_addr: SocketAddr,
    backend_addr: SocketAddr,
    frontend: Side,
    backend: Side,
    status: BrokerStatus,
}

impl BoundBroker {
    /// Resolved client-facing address (useful when bound to port 0).
    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend_addr
    }

    /// Resolved worker-facing address.
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Observation handle for connected-peer counts.
    pub fn status(&self) -> BrokerStatus {
        self.status.clone()
    }

    /// Relays until shutdown is requested or the transport fails.
    ///
    /// The relay core is one sequential loop blocking alternately on
    /// whichever side has traffic; all per-connection work happens in the
    /// connection layer threads feeding it.
    pub fn run(self, shutdown: ShutdownToken) -> Result<()> {
        let registry = Arc::new(ClientRegistry::default());
        let pool = Arc::new(WorkerPool::default());

        let (front_tx, front_rx) = crossbeam_channel::unbounded::<Delivery>();
        let (back_tx, back_rx) = crossbeam_channel::unbounded::<Delivery>();

        let front_acceptor = spawn_frontend_acceptor(
            self.frontend_listener,
            self.frontend.tls.clone(),
            self.frontend.gate.clone(),
            registry.clone(),
            front_tx,
            self.status.clone(),
            shutdown.clone(),
        )?;
        let back_acceptor = spawn_backend_acceptor(
            self.backend_listener,
            self.backend.tls.clone(),
            self.backend.gate.clone(),
            pool.clone(),
            back_tx,
            self.status.clone(),
            shutdown.clone(),
        )?;

        info!("broker running");
        let outcome = relay(&front_rx, &back_rx, &registry, &pool, &shutdown);

        if outcome.is_err() {
            // The relay died on its own; make the acceptors follow.
            shutdown.trigger();
        }
        info!("broker shutting down");

        for handle in [front_acceptor, back_acceptor] {
            if handle.join().is_err() {
                warn!("acceptor thread panicked during shutdown");
            }
        }

        self.frontend.gate.stop();
        self.backend.gate.stop();

        info!("broker stopped");
        outcome
    }
}

/// The forwarding loop: frontend traffic goes to a worker, backend traffic
/// goes back to its originating client. Deliveries pass through untouched.
fn relay(
    front_rx: &Receiver<Delivery>,
    back_rx: &Receiver<Delivery>,
    registry: &ClientRegistry,
    pool: &WorkerPool,
    shutdown: &ShutdownToken,
) -> Result<()> {
    loop {
        select! {
            recv(front_rx) -> delivery => match delivery {
                Ok(delivery) => pool.dispatch(delivery),
                Err(_) => return Err(ingress_lost("client-facing")),
            },
            recv(back_rx) -> delivery => match delivery {
                Ok(delivery) => registry.dispatch(delivery),
                Err(_) => return Err(ingress_lost("worker-facing")),
            },
            default(POLL_INTERVAL) => {
                if shutdown.is_triggered() {
                    return Ok(());
                }
            }
        }
    }
}

fn ingress_lost(side: &str) -> Error {
    error!(side, "ingress channel lost, terminating relay");
    Error::Transport(TransportError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{side} ingress disconnected"),
    )))
}

#[allow(clippy::too_many_arguments)]
fn spawn_frontend_acceptor(
    listener: TcpListener,
    tls: Option<ServerTlsConfig>,
    gate: Arc<dyn AccessGate>,
    registry: Arc<ClientRegistry>,
    ingress: Sender<Delivery>,
    status: BrokerStatus,
    shutdown: ShutdownToken,
) -> Result<JoinHandle<()>> {
    spawn_acceptor("frontend-acceptor", listener, gate, shutdown.clone(), move |id, sock| {
        let tls = tls.clone();
        let registry = registry.clone();
        let ingress = ingress.clone();
        let status = status.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name(format!("client-conn-{id}"))
            .spawn(move || {
                conn::client_connection(id, sock, tls, registry, ingress, status, shutdown)
            })
            .map(|_| ())
    })
}

fn spawn_backend_acceptor(
    listener: TcpListener,
    tls: Option<ServerTlsConfig>,
    gate: Arc<dyn AccessGate>,
    pool: Arc<WorkerPool>,
    ingress: Sender<Delivery>,
    status: BrokerStatus,
    shutdown: ShutdownToken,
) -> Result<JoinHandle<()>> {
    spawn_acceptor("backend-acceptor", listener, gate, shutdown.clone(), move |id, sock| {
        let tls = tls.clone();
        let pool = pool.clone();
        let ingress = ingress.clone();
        let status = status.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name(format!("worker-conn-{id}"))
            .spawn(move || {
                conn::worker_connection(id, sock, tls, pool, ingress, status, shutdown)
            })
            .map(|_| ())
    })
}

/// Shutdown-aware accept loop: non-blocking accepts with a short sleep so
/// the shutdown token is observed promptly. Peer addresses on the deny-list
/// are refused before any handshake work.
fn spawn_acceptor(
    name: &str,
    listener: TcpListener,
    gate: Arc<dyn AccessGate>,
    shutdown: ShutdownToken,
    mut spawn_conn: impl FnMut(ConnId, std::net::TcpStream) -> io::Result<()> + Send + 'static,
) -> Result<JoinHandle<()>> {
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::Transport(TransportError::Io(e)))?;

    let thread_name = name.to_string();
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut next_id: ConnId = 1;
            while !shutdown.is_triggered() {
                match listener.accept() {
                    Ok((sock, addr)) => {
                        if !gate.permits_address(&addr) {
                            warn!(%addr, "refusing denied address");
                            continue;
                        }
                        // Connection threads run in blocking mode.
                        if let Err(e) = sock.set_nonblocking(false) {
                            warn!(%addr, %e, "could not configure accepted socket");
                            continue;
                        }
                        let id = next_id;
                        next_id += 1;
                        if let Err(e) = spawn_conn(id, sock) {
                            warn!(%addr, %e, "failed to spawn connection thread");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        warn!(thread = %thread_name, %e, "accept failed");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        })
        .map_err(|e| Error::Transport(TransportError::Io(e)))?;

    Ok(handle)
}
