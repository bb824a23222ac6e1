//! Role-scoped keypair storage.
//!
//! Each role keeps its Ed25519 keypair in its own directory under the store
//! base; authorized peer keys live in a separate `authorized/` directory
//! that only ever holds public material.
//!
//! ```text
//! <base>/<role>/<role>.key   hex-encoded secret seed, owner-only
//! <base>/<role>/<role>.pub   hex-encoded public key
//! <base>/authorized/<name>.pub
//! ```

use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::error::KeyStoreError;

const KEYS_DIR_ENV: &str = "COURIER_KEYS_DIR";
const DEFAULT_KEYS_DIR: &str = "keys";
const AUTHORIZED_SUBDIR: &str = "authorized";

/// 32-byte Ed25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// An Ed25519 keypair bound to a role.
///
/// The secret key stays inside this type; it is never logged, sent over a
/// link, or written anywhere but the role's own key file.
pub struct KeyPair {
    role: String,
    signing: SigningKey,
}

impl KeyPair {
    fn new(role: &str, signing: SigningKey) -> Self {
        Self {
            role: role.to_string(),
            signing,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Raw secret seed, exposed only to the secure channel builder in this
    /// crate.
    pub(crate) fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret key deliberately absent.
        f.debug_struct("KeyPair")
            .field("role", &self.role)
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// Generates, persists and loads per-role keypairs and authorized peer keys.
#[derive(Debug, Clone)]
pub struct KeyStore {
    base: PathBuf,
}

impl KeyStore {
    pub fn open<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    /// Store rooted at `$COURIER_KEYS_DIR`, or `keys/` when unset.
    pub fn from_env() -> Self {
        let dir = env::var(KEYS_DIR_ENV).unwrap_or_else(|_| DEFAULT_KEYS_DIR.to_string());
        Self::open(dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Directory of authorized peer public keys, separate from every role
    /// directory.
    pub fn authorized_dir(&self) -> PathBuf {
        self.base.join(AUTHORIZED_SUBDIR)
    }

    fn role_dir(&self, role: &str) -> PathBuf {
        self.base.join(role)
    }

    fn secret_path(&self, role: &str) -> PathBuf {
        self.role_dir(role).join(format!("{role}.key"))
    }

    fn public_path(&self, role: &str) -> PathBuf {
        self.role_dir(role).join(format!("{role}.pub"))
    }

    /// Generates a fresh keypair for `role` and persists it, replacing any
    /// existing key material for that role.
    pub fn generate(&self, role: &str) -> Result<KeyPair, KeyStoreError> {
        let signing = SigningKey::generate(&mut OsRng);
        let pair = KeyPair::new(role, signing);
        self.persist(&pair).map_err(|source| KeyStoreError::Generation {
            role: role.to_string(),
            source,
        })?;
        tracing::info!(role, key = %pair.public_key(), "generated keypair");
        Ok(pair)
    }

    /// Loads the keypair for `role`, generating one first if none is stored.
    pub fn load_or_create(&self, role: &str) -> Result<KeyPair, KeyStoreError> {
        let secret_path = self.secret_path(role);
        if !secret_path.exists() {
            return self.generate(role);
        }

        let storage_err = |reason: String| KeyStoreError::Storage {
            role: role.to_string(),
            reason,
        };

        let hex_seed = fs::read_to_string(&secret_path)
            .map_err(|e| storage_err(format!("{}: {e}", secret_path.display())))?;
        let seed: [u8; 32] = hex::decode(hex_seed.trim())
            .map_err(|e| storage_err(format!("bad key encoding: {e}")))?
            .try_into()
            .map_err(|_| storage_err("secret key has wrong length".to_string()))?;

        let pair = KeyPair::new(role, SigningKey::from_bytes(&seed));

        // Recreate the public half if it went missing.
        let public_path = self.public_path(role);
        if !public_path.exists() {
            fs::write(&public_path, pair.public_key().to_hex())
                .map_err(|e| storage_err(format!("{}: {e}", public_path.display())))?;
        }
        Ok(pair)
    }

    /// Reads the published public key of a named peer.
    pub fn import_peer_public_key(&self, peer: &str) -> Result<PublicKey, KeyStoreError> {
        let path = self.public_path(peer);
        let contents =
            fs::read_to_string(&path).map_err(|_| KeyStoreError::NotFound(peer.to_string()))?;
        PublicKey::from_hex(&contents).ok_or_else(|| KeyStoreError::Storage {
            role: peer.to_string(),
            reason: format!("{} does not contain a valid public key", path.display()),
        })
    }

    /// Adds a public key to the authorized-peer listing under `name`.
    pub fn authorize(&self, name: &str, key: &PublicKey) -> Result<PathBuf, KeyStoreError> {
        let dir = self.authorized_dir();
        fs::create_dir_all(&dir).map_err(|e| KeyStoreError::Storage {
            role: name.to_string(),
            reason: format!("{}: {e}", dir.display()),
        })?;
        let path = dir.join(format!("{name}.pub"));
        fs::write(&path, key.to_hex()).map_err(|e| KeyStoreError::Storage {
            role: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(path)
    }

    fn persist(&self, pair: &KeyPair) -> io::Result<()> {
        let dir = self.role_dir(pair.role());
        fs::create_dir_all(&dir)?;

        let secret_path = self.secret_path(pair.role());
        fs::write(&secret_path, hex::encode(pair.secret_key_bytes()))?;
        restrict_to_owner(&secret_path)?;

        fs::write(self.public_path(pair.role()), pair.public_key().to_hex())?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());

        let generated = store.generate("broker-backend").unwrap();
        let loaded = store.load_or_create("broker-backend").unwrap();
        assert_eq!(generated.public_key(), loaded.public_key());
    }

    #[test]
    fn load_or_create_creates_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());

        let pair = store.load_or_create("worker").unwrap();
        assert!(dir.path().join("worker/worker.key").exists());
        assert!(dir.path().join("worker/worker.pub").exists());

        let again = store.load_or_create("worker").unwrap();
        assert_eq!(pair.public_key(), again.public_key());
    }

    #[test]
    fn peer_key_import_reads_published_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());

        let pair = store.generate("broker-backend").unwrap();
        let imported = store.import_peer_public_key("broker-backend").unwrap();
        assert_eq!(imported, pair.public_key());
    }

    #[test]
    fn missing_peer_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());
        assert!(matches!(
            store.import_peer_public_key("nobody"),
            Err(KeyStoreError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_secret_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());
        store.generate("client").unwrap();

        fs::write(dir.path().join("client/client.key"), "not-hex").unwrap();
        assert!(matches!(
            store.load_or_create("client"),
            Err(KeyStoreError::Storage { .. })
        ));
    }

    #[test]
    fn authorized_dir_never_receives_secret_material() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());

        let pair = store.generate("client").unwrap();
        store.authorize("client", &pair.public_key()).unwrap();

        let listed = fs::read_to_string(store.authorized_dir().join("client.pub")).unwrap();
        assert_eq!(listed, pair.public_key().to_hex());
        assert_ne!(listed, hex::encode(pair.secret_key_bytes()));
    }

    #[test]
    fn debug_output_omits_secret_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());
        let pair = store.generate("worker").unwrap();

        let printed = format!("{pair:?}");
        assert!(!printed.contains(&hex::encode(pair.secret_key_bytes())));
        assert!(printed.contains(&pair.public_key().to_hex()));
    }
}
