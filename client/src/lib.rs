//! Courier client library.
//!
//! Connects to a broker's client-facing endpoint, plaintext or over the
//! secure channel with the broker's key pinned, and performs blocking
//! request/reply round trips. Replies come back on the requesting
//! connection; the broker's envelope handling guarantees they belong to
//! this client even with many requesters connected.

mod client;

pub use client::{ClientConfig, CourierClient};
