//! Courier worker unit.
//!
//! A worker connects to the broker's worker-facing endpoint, takes exactly
//! one request at a time, hands it to an injected handler and returns the
//! reply under the same routing envelope. The business logic lives entirely
//! behind [`RequestHandler`]; this crate ships only the [`echo`] handler.
//!
//! When the backend link is encrypted the worker pins the broker's public
//! key, so it will only ever talk to the genuine broker. Nothing verifies
//! the worker back; that is the gate's job on the broker side.

use std::{fmt, net::TcpStream, thread, time::Duration};

use tracing::{debug, info};
use uuid::Uuid;

use courier_common::{
    config::{WorkerConfig, BACKEND_ROLE, WORKER_ROLE},
    secure::{self, ClientTlsConfig},
    wire::{Delivery, Link, Message},
    Error, HandlerError, KeyStore, PublicKey, Result, SecureStream, ShutdownToken,
    TransportError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Opaque diagnostic token, fixed for the lifetime of the unit. Appears in
/// logs only; plays no part in routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(Uuid);

impl Identity {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Injected request-handling logic: one request in, one reply out.
///
/// A handler failure is not isolated per message; it propagates and
/// terminates the owning unit.
pub trait RequestHandler: Send {
    fn handle(&mut self, request: Message) -> std::result::Result<Message, HandlerError>;
}

impl<F> RequestHandler for F
where
    F: FnMut(Message) -> std::result::Result<Message, HandlerError> + Send,
{
    fn handle(&mut self, request: Message) -> std::result::Result<Message, HandlerError> {
        self(request)
    }
}

/// The pass-through handler: every request comes back unchanged.
pub fn echo() -> impl RequestHandler {
    |request: Message| -> std::result::Result<Message, HandlerError> { Ok(request) }
}

/// One worker unit: a sequential receive → handle → send loop.
pub struct WorkerUnit {
    identity: Identity,
    config: WorkerConfig,
    tls: Option<ClientTlsConfig>,
    handler: Box<dyn RequestHandler>,
}

impl WorkerUnit {
    /// Builds a worker from configuration, resolving its own keypair and
    /// the broker's published key from the store when the link is
    /// encrypted.
    pub fn new<H>(config: WorkerConfig, keystore: &KeyStore, handler: H) -> Result<Self>
    where
        H: RequestHandler + 'static,
    {
        if config.encrypt {
            let broker_key = keystore.import_peer_public_key(BACKEND_ROLE)?;
            Self::with_broker_key(config, keystore, broker_key, handler)
        } else {
            Ok(Self::assemble(config, None, handler))
        }
    }

    /// Like [`WorkerUnit::new`] but pinning an explicitly supplied broker
    /// key, for deployments that distribute keys out of band.
    pub fn with_broker_key<H>(
        config: WorkerConfig,
        keystore: &KeyStore,
        broker_key: PublicKey,
        handler: H,
    ) -> Result<Self>
    where
        H: RequestHandler + 'static,
    {
        let keypair = keystore.load_or_create(WORKER_ROLE)?;
        let tls = secure::client_config(&keypair, broker_key)?;
        Ok(Self::assemble(config, Some(tls), handler))
    }

    fn assemble<H>(config: WorkerConfig, tls: Option<ClientTlsConfig>, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        Self {
            identity: Identity::generate(),
            config,
            tls,
            handler: Box::new(handler),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Connects to the broker and serves requests until shutdown. Transport
    /// and handler failures terminate the unit with an error.
    pub fn run(mut self, shutdown: ShutdownToken) -> Result<()> {
        let addr = self.config.backend.addr();
        let Some(sock) = connect_with_retry(&addr, &shutdown)? else {
            return Ok(());
        };

        let mut link = match &self.tls {
            Some(config) => Link::secure(SecureStream::connect(sock, config.clone())?),
            None => Link::plain(sock),
        };
        link.set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| Error::Transport(TransportError::Io(e)))?;

        info!(identity = %self.identity, %addr, "worker connected");

        loop {
            if shutdown.is_triggered() {
                info!(identity = %self.identity, "worker stopping");
                return Ok(());
            }

            match link.recv_poll::<Delivery>() {
                Ok(Some(delivery)) => {
                    let Delivery { envelope, message } = delivery;
                    let reply = self.handler.handle(message)?;
                    debug!(identity = %self.identity, "sending reply");
                    link.send(&Delivery::new(envelope, reply))
                        .map_err(Error::from)?;
                }
                Ok(None) => {}
                Err(e) => {
                    if shutdown.is_triggered() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

/// The broker may come up after its workers; keep knocking until it
/// answers or shutdown is requested.
fn connect_with_retry(addr: &str, shutdown: &ShutdownToken) -> Result<Option<TcpStream>> {
    let mut logged = false;
    loop {
        if shutdown.is_triggered() {
            return Ok(None);
        }
        match TcpStream::connect(addr) {
            Ok(sock) => return Ok(Some(sock)),
            Err(e) => {
                if !logged {
                    debug!(%addr, %e, "broker not reachable yet, retrying");
                    logged = true;
                }
                thread::sleep(CONNECT_RETRY);
            }
        }
    }
}
