use std::{
    io,
    net::TcpStream,
    time::{Duration, Instant},
};

use tracing::debug;

use courier_common::{
    config::{Endpoint, CLIENT_ROLE, FRONTEND_ROLE},
    secure::{self, ClientTlsConfig},
    wire::{Link, Message},
    Error, KeyStore, PublicKey, Result, SecureStream, TransportError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a Courier client connection.
pub struct ClientConfig {
    endpoint: Endpoint,
    timeout: Duration,
    tls: Option<ClientTlsConfig>,
}

impl ClientConfig {
    /// Plaintext connection to the broker's client-facing endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
            tls: None,
        }
    }

    /// How long [`CourierClient::request`] waits for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Secure the connection: load this client's keypair and the broker's
    /// published frontend key from the store.
    pub fn encrypted(self, keystore: &KeyStore) -> Result<Self> {
        let broker_key = keystore.import_peer_public_key(FRONTEND_ROLE)?;
        self.encrypted_with_key(keystore, broker_key)
    }

    /// Secure the connection against an explicitly supplied broker key.
    pub fn encrypted_with_key(
        mut self,
        keystore: &KeyStore,
        broker_key: PublicKey,
    ) -> Result<Self> {
        let keypair = keystore.load_or_create(CLIENT_ROLE)?;
        self.tls = Some(secure::client_config(&keypair, broker_key)?);
        Ok(self)
    }
}

/// A connected requester. One request is in flight at a time; the reply to
/// each request comes back on this same connection.
pub struct CourierClient {
    link: Link,
    timeout: Duration,
}

impl CourierClient {
    /// Connects (and, when configured, completes the secure handshake)
    /// before any request is sent.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let addr = config.endpoint.addr();
        debug!(%addr, encrypted = config.tls.is_some(), "connecting to broker");

        let sock = TcpStream::connect(&addr)
            .map_err(|e| Error::Transport(TransportError::Io(e)))?;

        let link = match &config.tls {
            Some(tls) => Link::secure(SecureStream::connect(sock, tls.clone())?),
            None => Link::plain(sock),
        };
        link.set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| Error::Transport(TransportError::Io(e)))?;

        Ok(Self {
            link,
            timeout: config.timeout,
        })
    }

    /// Sends one message and blocks for its reply, up to the configured
    /// timeout.
    pub fn request(&mut self, message: &Message) -> Result<Message> {
        self.link.send(message)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(reply) = self.link.recv_poll::<Message>()? {
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                return Err(Error::Transport(TransportError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no reply within the request timeout",
                ))));
            }
        }
    }
}
