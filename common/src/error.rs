use std::io;

use thiserror::Error;

/// Errors raised by the key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Keypair generation could not be completed or persisted.
    #[error("key generation for role '{role}' failed: {source}")]
    Generation {
        role: String,
        #[source]
        source: io::Error,
    },

    /// The role-scoped storage location exists but cannot be used.
    #[error("key storage for '{role}' is unusable: {reason}")]
    Storage { role: String, reason: String },

    /// No public key is stored under the requested peer name.
    #[error("no public key found for peer '{0}'")]
    NotFound(String),
}

/// Errors raised while moving framed messages over a link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// An inbound message exceeded the wire size cap.
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    /// The byte stream did not decode as a framed message.
    #[error("malformed wire data: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by an injected request handler.
///
/// Handler failures are not isolated per message: they propagate and
/// terminate the owning worker unit.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn msg<S: Into<String>>(reason: S) -> Self {
        Self(reason.into())
    }
}

/// Top-level error type covering every failure class in Courier.
///
/// Startup-phase errors (configuration, keys, bind, handshake setup) are
/// fatal to the owning process; mid-session transport errors terminate the
/// unit that hit them. Nothing is retried automatically.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory settings, detected before any socket is
    /// touched.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Key(#[from] KeyStoreError),

    /// An endpoint could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Secure channel setup or the handshake itself failed; no application
    /// frames were exchanged.
    #[error("secure channel failure: {0}")]
    Handshake(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that abort startup rather than a running session.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Key(_) | Error::Bind { .. } | Error::Handshake(_)
        )
    }
}
