//! Per-endpoint access control.
//!
//! An [`AccessGate`] decides which peers may complete a handshake on an
//! encrypted server endpoint. The permissive [`PermitAll`] gate is the
//! default; [`AuthorizedKeys`] restricts admission to an allow-list of
//! public keys loaded from the authorized-peer directory, with an optional
//! address deny-list applied before any handshake work is done.

use std::{
    collections::HashSet,
    fmt, fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::RwLock,
};

use crate::{
    error::{Error, Result},
    keystore::PublicKey,
};

/// Gate consulted by a server endpoint when admitting peers.
///
/// `start` and `stop` are idempotent and safe to call before the owning
/// endpoint is bound.
pub trait AccessGate: Send + Sync + fmt::Debug {
    fn start(&self) -> Result<()>;
    fn stop(&self);

    /// Checked against the peer address before any handshake is attempted.
    fn permits_address(&self, addr: &SocketAddr) -> bool;

    /// Checked against the peer's verified public key during the handshake.
    fn permits_key(&self, key: &PublicKey) -> bool;
}

/// Permissive default: every address and key is admitted.
#[derive(Debug, Default)]
pub struct PermitAll;

impl AccessGate for PermitAll {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn permits_address(&self, _addr: &SocketAddr) -> bool {
        true
    }

    fn permits_key(&self, _key: &PublicKey) -> bool {
        true
    }
}

/// Allow-list gate over the authorized-peer directory.
///
/// Until `start` has loaded the listing, and after `stop` has cleared it,
/// every key is refused.
pub struct AuthorizedKeys {
    domain: String,
    location: PathBuf,
    deny: Vec<IpAddr>,
    keys: RwLock<Option<HashSet<PublicKey>>>,
}

impl AuthorizedKeys {
    /// A gate for `domain` backed by the `*.pub` files under `location`.
    pub fn configure<P: Into<PathBuf>>(domain: &str, location: P) -> Self {
        Self {
            domain: domain.to_string(),
            location: location.into(),
            deny: Vec::new(),
            keys: RwLock::new(None),
        }
    }

    /// Addresses refused outright, before any handshake.
    pub fn deny_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.deny = addrs;
        self
    }

    fn load_listing(location: &Path) -> Result<HashSet<PublicKey>> {
        let entries = fs::read_dir(location).map_err(|e| {
            Error::Config(format!(
                "authorized keys location {} is unreadable: {e}",
                location.display()
            ))
        })?;

        let mut keys = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::Config(format!(
                    "authorized keys location {} is unreadable: {e}",
                    location.display()
                ))
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pub") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|s| PublicKey::from_hex(&s))
            {
                Some(key) => {
                    keys.insert(key);
                }
                None => {
                    tracing::warn!(path = %path.display(), "skipping unparsable authorized key");
                }
            }
        }
        Ok(keys)
    }
}

impl fmt::Debug for AuthorizedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self
            .keys
            .read()
            .map(|k| k.as_ref().map(|s| s.len()))
            .unwrap_or(None);
        f.debug_struct("AuthorizedKeys")
            .field("domain", &self.domain)
            .field("location", &self.location)
            .field("denied_addresses", &self.deny.len())
            .field("loaded_keys", &loaded)
            .finish()
    }
}

impl AccessGate for AuthorizedKeys {
    fn start(&self) -> Result<()> {
        let mut guard = self.keys.write().expect("authorized key set poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let keys = Self::load_listing(&self.location)?;
        tracing::info!(
            domain = %self.domain,
            location = %self.location.display(),
            count = keys.len(),
            "access control enabled"
        );
        *guard = Some(keys);
        Ok(())
    }

    fn stop(&self) {
        let mut guard = self.keys.write().expect("authorized key set poisoned");
        *guard = None;
    }

    fn permits_address(&self, addr: &SocketAddr) -> bool {
        !self.deny.contains(&addr.ip())
    }

    fn permits_key(&self, key: &PublicKey) -> bool {
        match self.keys.read().expect("authorized key set poisoned").as_ref() {
            Some(keys) => keys.contains(key),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    fn listing_with(keys: &[PublicKey]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, k) in keys.iter().enumerate() {
            fs::write(dir.path().join(format!("peer{i}.pub")), k.to_hex()).unwrap();
        }
        dir
    }

    #[test]
    fn permit_all_admits_everything() {
        let gate = PermitAll;
        gate.start().unwrap();
        assert!(gate.permits_address(&"10.0.0.1:9".parse().unwrap()));
        assert!(gate.permits_key(&key(0xAB)));
        gate.stop();
    }

    #[test]
    fn allow_list_admits_only_listed_keys() {
        let dir = listing_with(&[key(1), key(2)]);
        let gate = AuthorizedKeys::configure("*", dir.path());
        gate.start().unwrap();

        assert!(gate.permits_key(&key(1)));
        assert!(gate.permits_key(&key(2)));
        assert!(!gate.permits_key(&key(3)));
    }

    #[test]
    fn keys_are_refused_before_start_and_after_stop() {
        let dir = listing_with(&[key(7)]);
        let gate = AuthorizedKeys::configure("*", dir.path());

        assert!(!gate.permits_key(&key(7)));
        gate.start().unwrap();
        assert!(gate.permits_key(&key(7)));
        gate.stop();
        assert!(!gate.permits_key(&key(7)));
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let dir = listing_with(&[key(9)]);
        let gate = AuthorizedKeys::configure("*", dir.path());

        gate.start().unwrap();
        gate.start().unwrap();
        assert!(gate.permits_key(&key(9)));
        gate.stop();
        gate.stop();
        assert!(!gate.permits_key(&key(9)));
    }

    #[test]
    fn denied_addresses_are_refused() {
        let dir = listing_with(&[]);
        let gate = AuthorizedKeys::configure("*", dir.path())
            .deny_addresses(vec!["10.1.2.3".parse().unwrap()]);
        gate.start().unwrap();

        assert!(!gate.permits_address(&"10.1.2.3:4444".parse().unwrap()));
        assert!(gate.permits_address(&"10.1.2.4:4444".parse().unwrap()));
    }

    #[test]
    fn missing_listing_directory_fails_startup() {
        let gate = AuthorizedKeys::configure("*", "/nonexistent/authorized");
        assert!(matches!(gate.start(), Err(Error::Config(_))));
    }
}
