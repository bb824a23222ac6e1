//! Courier Common Library
//!
//! Shared building blocks for the Courier request/reply relay: the framed
//! wire protocol, role-scoped key storage, secure channel construction,
//! per-endpoint access control, and the configuration and shutdown plumbing
//! every unit shares.
//!
//! # Features
//!
//! - **Opaque framing**: multipart messages whose frames the relay never
//!   inspects, with routing envelopes owned by the connection layer
//! - **Key management**: per-role Ed25519 keypairs with a separate
//!   authorized-peer listing
//! - **Secure channels**: TLS bound to raw public keys, open or
//!   allow-listed server posture, key-pinned client posture
//! - **Cooperative shutdown**: a token polled by every unit loop

/// Configuration structures and role names
pub mod config;

/// Error taxonomy shared across the workspace
pub mod error;

/// Per-endpoint access control gates
pub mod access;

/// Role-scoped keypair storage
pub mod keystore;

/// Secure channel construction and the TLS stream wrapper
pub mod secure;

/// Cooperative shutdown token
pub mod shutdown;

/// Wire framing and the link abstraction
pub mod wire;

// Re-export commonly used types for convenience
pub use access::{AccessGate, AuthorizedKeys, PermitAll};
pub use config::{BrokerConfig, Endpoint, EndpointConfig, WorkerConfig};
pub use error::{Error, HandlerError, KeyStoreError, Result, TransportError};
pub use keystore::{KeyPair, KeyStore, PublicKey};
pub use secure::SecureStream;
pub use shutdown::ShutdownToken;
pub use wire::{Delivery, Frame, Link, Message};
