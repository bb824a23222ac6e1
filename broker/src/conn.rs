//! Broker connection layer.
//!
//! Everything envelope-shaped lives here: client connections tag inbound
//! messages with their connection id on the way to the relay, and replies
//! coming back have that tag consumed to find the right client again. The
//! relay core in `lib.rs` never opens an envelope and never sees a payload
//! frame.

use std::{
    collections::HashMap,
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use courier_common::{
    secure::ServerTlsConfig,
    wire::{Delivery, Frame, Link, Message},
    Error, SecureStream, ShutdownToken, TransportError,
};

/// How long a connection loop blocks on the socket before checking its
/// outbound queue and the shutdown token.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) type ConnId = u64;

fn envelope_frame(id: ConnId) -> Frame {
    id.to_be_bytes().to_vec()
}

fn envelope_conn(envelope: &[Frame]) -> Option<ConnId> {
    let first = envelope.first()?;
    let bytes: [u8; 8] = first.as_slice().try_into().ok()?;
    Some(ConnId::from_be_bytes(bytes))
}

/// Connected-peer counters exposed for observation; never used for routing.
#[derive(Clone, Debug, Default)]
pub struct BrokerStatus {
    clients: Arc<AtomicUsize>,
    workers: Arc<AtomicUsize>,
}

impl BrokerStatus {
    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn connected_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }
}

/// Live client connections, keyed by the id their envelopes carry.
#[derive(Default)]
pub(crate) struct ClientRegistry {
    conns: Mutex<HashMap<ConnId, Sender<Message>>>,
}

impl ClientRegistry {
    fn register(&self, id: ConnId, tx: Sender<Message>) {
        self.conns.lock().expect("client registry poisoned").insert(id, tx);
    }

    fn deregister(&self, id: ConnId) {
        self.conns.lock().expect("client registry poisoned").remove(&id);
    }

    /// Consumes the delivery's envelope and hands the payload to the
    /// originating client's connection, if it is still with us.
    pub(crate) fn dispatch(&self, delivery: Delivery) {
        let Some(id) = envelope_conn(&delivery.envelope) else {
            warn!("dropping reply with unreadable envelope");
            return;
        };
        let conns = self.conns.lock().expect("client registry poisoned");
        match conns.get(&id) {
            Some(tx) => {
                if tx.send(delivery.message).is_err() {
                    debug!(conn = id, "client went away before its reply");
                }
            }
            None => debug!(conn = id, "no such client for reply, dropping"),
        }
    }
}

/// Connected workers, dispatched to in round-robin order.
#[derive(Default)]
pub(crate) struct WorkerPool {
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    ring: Vec<(ConnId, Sender<Delivery>)>,
    next: usize,
}

impl WorkerPool {
    fn register(&self, id: ConnId, tx: Sender<Delivery>) {
        self.inner.lock().expect("worker pool poisoned").ring.push((id, tx));
    }

    fn deregister(&self, id: ConnId) {
        let mut inner = self.inner.lock().expect("worker pool poisoned");
        inner.ring.retain(|(conn, _)| *conn != id);
    }

    /// Fair dispatch: the next connected worker takes the request. Workers
    /// found dead are dropped from the ring on the way. With no worker
    /// connected the request is dropped; nothing is queued.
    pub(crate) fn dispatch(&self, delivery: Delivery) {
        let mut inner = self.inner.lock().expect("worker pool poisoned");
        for _ in 0..inner.ring.len() {
            let pick = inner.next % inner.ring.len();
            inner.next = inner.next.wrapping_add(1);
            let (id, tx) = inner.ring[pick].clone();
            if tx.send(delivery.clone()).is_ok() {
                return;
            }
            inner.ring.retain(|(conn, _)| *conn != id);
            if inner.ring.is_empty() {
                break;
            }
        }
        warn!("no connected worker, dropping request");
    }
}

/// One client connection: handshake, register, then shuttle messages until
/// the peer leaves or shutdown is requested.
#[allow(clippy::too_many_arguments)]
pub(crate) fn client_connection(
    id: ConnId,
    sock: TcpStream,
    tls: Option<ServerTlsConfig>,
    registry: Arc<ClientRegistry>,
    ingress: Sender<Delivery>,
    status: BrokerStatus,
    shutdown: ShutdownToken,
) {
    let peer = sock.peer_addr().ok();
    let mut link = match establish(sock, tls) {
        Ok(link) => link,
        Err(e) => {
            info!(?peer, %e, "client handshake failed");
            return;
        }
    };
    if let Err(e) = link.set_read_timeout(Some(POLL_INTERVAL)) {
        warn!(?peer, %e, "could not configure client socket");
        return;
    }

    let (out_tx, out_rx) = crossbeam_channel::unbounded::<Message>();
    registry.register(id, out_tx);
    status.clients.fetch_add(1, Ordering::SeqCst);
    debug!(conn = id, ?peer, "client connected");

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let mut failed = false;
        while let Ok(reply) = out_rx.try_recv() {
            if let Err(e) = link.send(&reply) {
                debug!(conn = id, %e, "client write failed");
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }

        match link.recv_poll::<Message>() {
            Ok(Some(message)) => {
                let delivery = Delivery::new(vec![envelope_frame(id)], message);
                if ingress.send(delivery).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                debug!(conn = id, "client disconnected");
                break;
            }
            Err(e) => {
                debug!(conn = id, %e, "client read failed");
                break;
            }
        }
    }

    registry.deregister(id);
    status.clients.fetch_sub(1, Ordering::SeqCst);
}

/// One worker connection: the mirror of [`client_connection`], carrying
/// whole deliveries so envelopes survive the round trip untouched.
pub(crate) fn worker_connection(
    id: ConnId,
    sock: TcpStream,
    tls: Option<ServerTlsConfig>,
    pool: Arc<WorkerPool>,
    ingress: Sender<Delivery>,
    status: BrokerStatus,
    shutdown: ShutdownToken,
) {
    let peer = sock.peer_addr().ok();
    let mut link = match establish(sock, tls) {
        Ok(link) => link,
        Err(e) => {
            info!(?peer, %e, "worker handshake failed");
            return;
        }
    };
    if let Err(e) = link.set_read_timeout(Some(POLL_INTERVAL)) {
        warn!(?peer, %e, "could not configure worker socket");
        return;
    }

    let (out_tx, out_rx) = crossbeam_channel::unbounded::<Delivery>();
    pool.register(id, out_tx);
    status.workers.fetch_add(1, Ordering::SeqCst);
    info!(conn = id, ?peer, "worker connected");

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let mut failed = false;
        while let Ok(request) = out_rx.try_recv() {
            if let Err(e) = link.send(&request) {
                debug!(conn = id, %e, "worker write failed");
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }

        match link.recv_poll::<Delivery>() {
            Ok(Some(delivery)) => {
                if ingress.send(delivery).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                info!(conn = id, "worker disconnected");
                break;
            }
            Err(e) => {
                warn!(conn = id, %e, "worker read failed");
                break;
            }
        }
    }

    pool.deregister(id);
    status.workers.fetch_sub(1, Ordering::SeqCst);
}

fn establish(sock: TcpStream, tls: Option<ServerTlsConfig>) -> Result<Link, Error> {
    match tls {
        Some(config) => Ok(Link::secure(SecureStream::accept(sock, config)?)),
        None => Ok(Link::plain(sock)),
    }
}
