//! Secure channel construction.
//!
//! Courier binds a connection to its owner's Ed25519 keypair the way the
//! rest of the stack binds identity to keys: the 32-byte public key IS the
//! peer's identity. Each endpoint mints a self-signed certificate from its
//! keypair at startup; nothing involves a CA.
//!
//! - A server endpoint is open by default: any client that can complete the
//!   handshake is admitted. With an [`AccessGate`] attached, a client
//!   certificate is required and its key is checked against the gate.
//! - A client endpoint names the server key it expects in advance and
//!   refuses to finish the handshake against anything else.
//!
//! No application frame moves on a secured socket before its handshake
//! completes.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::{
    access::AccessGate,
    error::{Error, Result},
    keystore::{KeyPair, PublicKey},
};

/// Shared rustls crypto provider (ring).
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Ready-to-share TLS configuration for a server endpoint.
pub type ServerTlsConfig = Arc<rustls::ServerConfig>;

/// Ready-to-share TLS configuration for a connecting endpoint.
pub type ClientTlsConfig = Arc<rustls::ClientConfig>;

/// SNI label presented by clients; identity is pinned by key, not by name.
const SERVER_NAME: &str = "courier";

/// Minimal PKCS#8 v1 wrapping of an Ed25519 seed.
fn pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}

/// Self-signed certificate chain + private key for a keypair.
fn tls_identity(
    keypair: &KeyPair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = pkcs8_from_seed(&keypair.secret_key_bytes());
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let cert_key = rcgen::KeyPair::try_from(&pkcs8_der)
        .map_err(|e| Error::Handshake(format!("certificate keypair: {e}")))?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| Error::Handshake(format!("certificate params: {e}")))?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.public_key().to_hex()),
    );

    let cert = params
        .self_signed(&cert_key)
        .map_err(|e| Error::Handshake(format!("self-signed certificate: {e}")))?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

/// Recovers the raw Ed25519 public key from a certificate.
pub fn public_key_from_cert(cert_der: &[u8]) -> Option<PublicKey> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    let arr: [u8; 32] = key_bytes.as_ref().try_into().ok()?;
    Some(PublicKey::from_bytes(arr))
}

/// Builds the TLS configuration for a server endpoint.
///
/// With no gate the posture is open: clients are not asked for a
/// certificate. With a gate, a client certificate is mandatory and its key
/// must pass the gate's allow-list.
pub fn server_config(
    keypair: &KeyPair,
    gate: Option<Arc<dyn AccessGate>>,
) -> Result<ServerTlsConfig> {
    let (certs, key) = tls_identity(keypair)?;

    let builder = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Handshake(format!("protocol versions: {e}")))?;

    let config = match gate {
        Some(gate) => builder
            .with_client_cert_verifier(Arc::new(GateClientVerifier { gate }))
            .with_single_cert(certs, key),
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::Handshake(format!("server TLS config: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds the TLS configuration for a connecting endpoint.
///
/// The connection presents `keypair` for client auth and only completes
/// against a server whose certificate carries exactly
/// `expected_server_key`.
pub fn client_config(
    keypair: &KeyPair,
    expected_server_key: PublicKey,
) -> Result<ClientTlsConfig> {
    let (certs, key) = tls_identity(keypair)?;

    let config = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Handshake(format!("protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
            expected: expected_server_key,
        }))
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Handshake(format!("client TLS config: {e}")))?;

    Ok(Arc::new(config))
}

/// Client certificate verifier backed by an access gate.
#[derive(Debug)]
struct GateClientVerifier {
    gate: Arc<dyn AccessGate>,
}

impl rustls::server::danger::ClientCertVerifier for GateClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let key = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if !self.gate.permits_key(&key) {
            tracing::warn!(peer = %key, "rejected unauthorized peer");
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Server certificate verifier pinned to one expected public key.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: PublicKey,
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let presented = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if presented != self.expected {
            tracing::warn!(
                expected = %self.expected,
                presented = %presented,
                "server key mismatch, refusing handshake"
            );
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

/// Synchronous TLS stream over a TCP socket.
///
/// Construction completes the handshake; a [`SecureStream`] that exists has
/// an established session.
pub struct SecureStream {
    sock: TcpStream,
    tls: rustls::Connection,
}

impl SecureStream {
    /// Server side: run the handshake on an accepted socket.
    pub fn accept(sock: TcpStream, config: ServerTlsConfig) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        let mut stream = Self {
            sock,
            tls: rustls::Connection::Server(conn),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Client side: connect-time handshake against the pinned server key.
    pub fn connect(sock: TcpStream, config: ClientTlsConfig) -> Result<Self> {
        let server_name = rustls::pki_types::ServerName::try_from(SERVER_NAME)
            .map_err(|e| Error::Handshake(format!("server name: {e}")))?;
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        let mut stream = Self {
            sock,
            tls: rustls::Connection::Client(conn),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    fn complete_handshake(&mut self) -> Result<()> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls
                    .write_tls(&mut self.sock)
                    .map_err(|e| Error::Handshake(e.to_string()))?;
            }
            if self.tls.wants_read() {
                let n = self
                    .tls
                    .read_tls(&mut self.sock)
                    .map_err(|e| Error::Handshake(e.to_string()))?;
                if n == 0 {
                    return Err(Error::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                }
                self.tls
                    .process_new_packets()
                    .map_err(|e| Error::Handshake(e.to_string()))?;
            }
        }
        // Flush our final flight so the peer is not left waiting.
        while self.tls.wants_write() {
            self.tls
                .write_tls(&mut self.sock)
                .map_err(|e| Error::Handshake(e.to_string()))?;
        }
        Ok(())
    }

    /// The peer's certificate key, when the session carries one.
    pub fn peer_public_key(&self) -> Option<PublicKey> {
        let certs = self.tls.peer_certificates()?;
        public_key_from_cert(certs.first()?.as_ref())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }
}

impl Read for SecureStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                // No buffered plaintext; pull more TLS data below.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.tls.wants_read() {
                return Ok(0);
            }
            match self.tls.read_tls(&mut self.sock)? {
                0 => return Ok(0),
                _ => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
            }
        }
    }
}

impl Write for SecureStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        while self.tls.wants_write() {
            if let Err(e) = self.tls.write_tls(&mut self.sock) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    return Err(e);
                }
                break;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.sock.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::access::AuthorizedKeys;
    use crate::keystore::KeyStore;
    use crate::wire::{Link, Message};

    fn test_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn pkcs8_wrapping_has_expected_shape() {
        let pkcs8 = pkcs8_from_seed(&[7u8; 32]);
        assert_eq!(pkcs8.len(), 48);
        assert_eq!(&pkcs8[..2], &[0x30, 0x2e]);
        assert_eq!(&pkcs8[16..], &[7u8; 32]);
    }

    #[test]
    fn certificate_carries_the_keypair_public_key() {
        let (_dir, store) = test_store();
        let pair = store.generate("broker-backend").unwrap();

        let (certs, _key) = tls_identity(&pair).unwrap();
        let extracted = public_key_from_cert(certs[0].as_ref()).unwrap();
        assert_eq!(extracted, pair.public_key());
    }

    #[test]
    fn handshake_succeeds_against_the_pinned_key() {
        let (_dir, store) = test_store();
        let server_pair = store.generate("broker-backend").unwrap();
        let client_pair = store.generate("worker").unwrap();
        let server_key = server_pair.public_key();

        let server_cfg = server_config(&server_pair, None).unwrap();
        let client_cfg = client_config(&client_pair, server_key).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let stream = SecureStream::accept(sock, server_cfg).unwrap();
            let mut link = Link::secure(stream);
            let msg: Message = link.recv().unwrap();
            link.send(&msg).unwrap();
        });

        let sock = TcpStream::connect(addr).unwrap();
        let stream = SecureStream::connect(sock, client_cfg).unwrap();
        let mut link = Link::secure(stream);

        let msg = Message::single(b"over-tls".to_vec());
        link.send(&msg).unwrap();
        let echoed: Message = link.recv().unwrap();
        assert_eq!(echoed, msg);

        server.join().unwrap();
    }

    #[test]
    fn mismatched_server_key_aborts_before_any_frame() {
        let (_dir, store) = test_store();
        let server_pair = store.generate("broker-backend").unwrap();
        let client_pair = store.generate("worker").unwrap();
        let wrong_key = store.generate("impostor").unwrap().public_key();

        let server_cfg = server_config(&server_pair, None).unwrap();
        let client_cfg = client_config(&client_pair, wrong_key).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            // Handshake must fail; no frame ever arrives.
            SecureStream::accept(sock, server_cfg).err()
        });

        let sock = TcpStream::connect(addr).unwrap();
        assert!(matches!(
            SecureStream::connect(sock, client_cfg),
            Err(Error::Handshake(_))
        ));
        assert!(server.join().unwrap().is_some());
    }

    #[test]
    fn gate_rejects_unauthorized_client_key() {
        let (_dir, store) = test_store();
        let server_pair = store.generate("broker-frontend").unwrap();
        let allowed_pair = store.generate("client").unwrap();
        let stranger_pair = store.generate("stranger").unwrap();
        let server_key = server_pair.public_key();

        store.authorize("client", &allowed_pair.public_key()).unwrap();
        let gate: Arc<dyn AccessGate> =
            Arc::new(AuthorizedKeys::configure("*", store.authorized_dir()));
        gate.start().unwrap();

        let server_cfg = server_config(&server_pair, Some(gate)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_cfg = server_cfg.clone();
        let server = thread::spawn(move || {
            let mut outcomes = Vec::new();
            for _ in 0..2 {
                let (sock, _) = listener.accept().unwrap();
                outcomes.push(SecureStream::accept(sock, accept_cfg.clone()).is_ok());
            }
            outcomes
        });

        let allowed_cfg = client_config(&allowed_pair, server_key).unwrap();
        let sock = TcpStream::connect(addr).unwrap();
        SecureStream::connect(sock, allowed_cfg).unwrap();

        let stranger_cfg = client_config(&stranger_pair, server_key).unwrap();
        let sock = TcpStream::connect(addr).unwrap();
        // The server refuses the stranger; depending on timing the client
        // sees the failure during the handshake or on first use.
        let _ = SecureStream::connect(sock, stranger_cfg);

        assert_eq!(server.join().unwrap(), vec![true, false]);
    }
}
