//! End-to-end relay tests over loopback TCP.
//!
//! Each test binds a broker on ephemeral ports, connects real worker and
//! client units and exercises full request/reply round trips, including
//! the encrypted and access-controlled configurations.

use std::{
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use courier_broker::{BrokerStatus, ProxyBroker};
use courier_client::{ClientConfig, CourierClient};
use courier_common::{
    config::{BrokerConfig, Endpoint, EndpointConfig, WorkerConfig, BACKEND_ROLE},
    wire::Message,
    Error, KeyStore, ShutdownToken,
};
use courier_worker::{echo, WorkerUnit};

const SETTLE: Duration = Duration::from_secs(5);

fn open_loopback_config() -> BrokerConfig {
    BrokerConfig {
        frontend: EndpointConfig::open(Endpoint::new("127.0.0.1", 0)),
        backend: EndpointConfig::open(Endpoint::new("127.0.0.1", 0)),
    }
}

struct Harness {
    token: ShutdownToken,
    broker: thread::JoinHandle<courier_common::Result<()>>,
    workers: Vec<thread::JoinHandle<courier_common::Result<()>>>,
    frontend: SocketAddr,
    backend: SocketAddr,
    status: BrokerStatus,
}

impl Harness {
    fn start(config: BrokerConfig, store: &KeyStore) -> Self {
        let bound = ProxyBroker::new(config, store)
            .expect("broker configuration")
            .bind()
            .expect("broker bind");

        let frontend = bound.frontend_addr();
        let backend = bound.backend_addr();
        let status = bound.status();
        let token = ShutdownToken::new();
        let broker_token = token.clone();
        let broker = thread::spawn(move || bound.run(broker_token));

        Self {
            token,
            broker,
            workers: Vec::new(),
            frontend,
            backend,
            status,
        }
    }

    fn worker_config(&self, encrypt: bool) -> WorkerConfig {
        WorkerConfig {
            backend: Endpoint::new(self.backend.ip().to_string(), self.backend.port()),
            encrypt,
        }
    }

    fn spawn_worker(&mut self, unit: WorkerUnit) {
        let token = self.token.clone();
        self.workers.push(thread::spawn(move || unit.run(token)));
    }

    fn spawn_echo_workers(&mut self, store: &KeyStore, count: usize, encrypt: bool) {
        for _ in 0..count {
            let unit = WorkerUnit::new(self.worker_config(encrypt), store, echo())
                .expect("worker setup");
            self.spawn_worker(unit);
        }
        assert!(
            wait_until(SETTLE, || self.status.connected_workers() == count),
            "workers never connected"
        );
    }

    fn client(&self) -> CourierClient {
        let endpoint = Endpoint::new(self.frontend.ip().to_string(), self.frontend.port());
        CourierClient::connect(
            ClientConfig::new(endpoint).with_timeout(Duration::from_secs(5)),
        )
        .expect("client connect")
    }

    fn shutdown(self) {
        self.token.trigger();
        assert!(self.broker.join().unwrap().is_ok(), "broker exit");
        for worker in self.workers {
            assert!(worker.join().unwrap().is_ok(), "worker exit");
        }
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn ping_round_trips_through_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut harness = Harness::start(open_loopback_config(), &store);
    harness.spawn_echo_workers(&store, 1, false);

    let mut client = harness.client();
    let request = Message::single(b"PING".to_vec());
    let reply = client.request(&request).unwrap();
    assert_eq!(reply, request);

    harness.shutdown();
}

#[test]
fn frames_survive_the_relay_in_order_and_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut harness = Harness::start(open_loopback_config(), &store);
    harness.spawn_echo_workers(&store, 1, false);

    let frames: Vec<Vec<u8>> = (0u8..16)
        .map(|i| (0..=i).map(|b| b.wrapping_mul(37)).collect())
        .collect();
    let request = Message::from_frames(frames.clone());

    let mut client = harness.client();
    let reply = client.request(&request).unwrap();
    assert_eq!(reply.frames(), frames.as_slice());

    harness.shutdown();
}

#[test]
fn concurrent_clients_each_get_their_own_replies() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut harness = Harness::start(open_loopback_config(), &store);
    harness.spawn_echo_workers(&store, 2, false);

    let mut clients = Vec::new();
    for c in 0..4u8 {
        let mut client = harness.client();
        clients.push(thread::spawn(move || {
            for n in 0..8u8 {
                let request = Message::from_frames(vec![
                    format!("client-{c}").into_bytes(),
                    vec![n; 16],
                ]);
                let reply = client.request(&request).expect("reply");
                assert_eq!(reply, request, "reply crossed between clients");
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    harness.shutdown();
}

#[test]
fn encrypted_backend_round_trips_and_leaks_no_key_material() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut config = open_loopback_config();
    config.backend.encrypt = true;

    let mut harness = Harness::start(config, &store);
    harness.spawn_echo_workers(&store, 1, true);

    let mut client = harness.client();
    let request = Message::single(b"over-the-secure-leg".to_vec());
    let reply = client.request(&request).unwrap();
    assert_eq!(reply, request);

    // The relayed payload must never contain the broker's secret key, in
    // raw or hex form.
    let secret_hex = std::fs::read_to_string(
        dir.path().join(format!("{BACKEND_ROLE}/{BACKEND_ROLE}.key")),
    )
    .unwrap();
    let secret_raw = {
        let mut bytes = Vec::new();
        let hexed = secret_hex.trim().as_bytes();
        for pair in hexed.chunks(2) {
            let s = std::str::from_utf8(pair).unwrap();
            bytes.push(u8::from_str_radix(s, 16).unwrap());
        }
        bytes
    };
    for frame in reply.frames() {
        assert!(!contains(frame, secret_hex.trim().as_bytes()));
        assert!(!contains(frame, &secret_raw));
    }

    harness.shutdown();
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn mismatched_worker_key_relays_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut config = open_loopback_config();
    config.backend.encrypt = true;

    let harness = Harness::start(config, &store);

    // The worker pins the wrong broker key; its handshake must fail.
    let impostor_key = store.generate("impostor").unwrap().public_key();
    let unit = WorkerUnit::with_broker_key(
        harness.worker_config(true),
        &store,
        impostor_key,
        echo(),
    )
    .unwrap();
    let worker_token = harness.token.clone();
    let worker = thread::spawn(move || unit.run(worker_token));

    match worker.join().unwrap() {
        Err(Error::Handshake(_)) => {}
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert_eq!(harness.status.connected_workers(), 0);

    // No worker ever completed the handshake, so nothing answers.
    let endpoint = Endpoint::new(
        harness.frontend.ip().to_string(),
        harness.frontend.port(),
    );
    let mut client = CourierClient::connect(
        ClientConfig::new(endpoint).with_timeout(Duration::from_millis(300)),
    )
    .unwrap();
    assert!(client.request(&Message::single(b"PING".to_vec())).is_err());

    harness.shutdown();
}

#[test]
fn frontend_access_control_admits_only_authorized_clients() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    // Authorize our client role before the broker loads the listing.
    let client_key = store.load_or_create("client").unwrap().public_key();
    store.authorize("client", &client_key).unwrap();

    let mut config = open_loopback_config();
    config.frontend.encrypt = true;
    config.frontend.access_control = true;

    let mut harness = Harness::start(config, &store);
    harness.spawn_echo_workers(&store, 1, false);

    let endpoint = Endpoint::new(
        harness.frontend.ip().to_string(),
        harness.frontend.port(),
    );

    // Authorized client: full round trip.
    let authorized = ClientConfig::new(endpoint.clone())
        .with_timeout(Duration::from_secs(5))
        .encrypted(&store)
        .unwrap();
    let mut client = CourierClient::connect(authorized).unwrap();
    let request = Message::single(b"hello".to_vec());
    assert_eq!(client.request(&request).unwrap(), request);

    // A stranger with its own keypair is refused by the gate.
    let stranger_dir = tempfile::tempdir().unwrap();
    let stranger_store = KeyStore::open(stranger_dir.path());
    let broker_key = store.import_peer_public_key("broker-frontend").unwrap();
    let stranger = ClientConfig::new(endpoint)
        .with_timeout(Duration::from_millis(300))
        .encrypted_with_key(&stranger_store, broker_key)
        .unwrap();
    let outcome = CourierClient::connect(stranger)
        .and_then(|mut c| c.request(&Message::single(b"let me in".to_vec())));
    assert!(outcome.is_err(), "unauthorized client got through");

    harness.shutdown();
}

#[test]
fn access_control_without_encryption_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    let mut config = open_loopback_config();
    config.frontend.access_control = true;

    match ProxyBroker::new(config, &store) {
        Err(Error::Config(_)) => {}
        other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn broker_binds_neither_endpoint_when_one_is_taken() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path());

    // Occupy a port, then point the backend at it.
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap();

    let mut config = open_loopback_config();
    config.backend.endpoint = Endpoint::new(taken.ip().to_string(), taken.port());

    match ProxyBroker::new(config, &store).unwrap().bind() {
        Err(Error::Bind { .. }) => {}
        Ok(_) => panic!("bind should have failed"),
        Err(other) => panic!("expected bind error, got {other:?}"),
    }
}
