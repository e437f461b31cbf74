//! Per-client virtual datagram endpoint.
//!
//! [`QueuePacketConn`] is the seam between the DNS carrier and the reliable
//! transport. The carrier pushes decoded packets in with a client id attached
//! and pulls queued downstream packets back out; the transport layer sees a
//! single datagram endpoint addressed by client id. No real socket is bound.
//!
//! All queues are bounded and drop on overflow: the DNS side of the tunnel is
//! lossy by nature and the ARQ layer above recovers, so backpressure must
//! never reach the carrier.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
// tokio's Instant so that idle eviction honors the test clock.
use tokio::time::Instant;

/// Packets queued per direction before overflow drops begin.
const QUEUE_CAPACITY: usize = 256;

/// Opaque 8-byte client identifier, chosen by the client and carried at the
/// front of every decoded query payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClientId([u8; 8]);

impl ClientId {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: [u8; 8]) -> ClientId {
        ClientId(bytes)
    }

    /// Splits a decoded payload into its leading client id and the rest.
    pub fn from_payload(payload: &[u8]) -> Option<(ClientId, &[u8])> {
        if payload.len() < Self::LEN {
            return None;
        }
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&payload[..Self::LEN]);
        Some((ClientId(id), &payload[Self::LEN..]))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The receive handle for one client's outbound queue. The carrier's send
/// loop holds this while it assembles a response bundle.
pub type OutgoingQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>;

struct ClientEntry {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: OutgoingQueue,
    last_activity: Instant,
}

struct Inner {
    clients: HashMap<ClientId, ClientEntry>,
    /// Fan-in for all clients' inbound packets; `None` once closed.
    recv_tx: Option<mpsc::Sender<(Vec<u8>, ClientId)>>,
}

/// A datagram endpoint keyed by [`ClientId`], with bounded per-client queues
/// and coarse idle eviction.
pub struct QueuePacketConn {
    inner: Mutex<Inner>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, ClientId)>>,
    idle_timeout: Duration,
}

impl QueuePacketConn {
    /// Creates the endpoint and starts its eviction task. Clients idle longer
    /// than `idle_timeout` are reaped.
    pub fn new(idle_timeout: Duration) -> Arc<QueuePacketConn> {
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let conn = Arc::new(QueuePacketConn {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                recv_tx: Some(recv_tx),
            }),
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            idle_timeout,
        });
        tokio::spawn(reap_loop(Arc::downgrade(&conn)));
        conn
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Appends an inbound packet for `client`, creating the client's queues on
    /// first sight. Drops the packet if the queue is full or the endpoint is
    /// closed.
    pub fn queue_incoming(&self, packet: &[u8], client: ClientId) {
        let tx = {
            let mut inner = self.lock();
            let Some(tx) = inner.recv_tx.clone() else {
                return;
            };
            touch(&mut inner, client);
            tx
        };
        let _ = tx.try_send((packet.to_vec(), client));
    }

    /// Appends an outbound packet for `client`. Callable from synchronous
    /// contexts; drops the packet if the queue is full.
    pub fn write_to(&self, packet: &[u8], client: ClientId) {
        let tx = {
            let mut inner = self.lock();
            if inner.recv_tx.is_none() {
                return;
            }
            touch(&mut inner, client).outbound_tx.clone()
        };
        let _ = tx.try_send(packet.to_vec());
    }

    /// Blocks until some client has an inbound packet. Returns `None` once
    /// the endpoint is closed and drained. Per-client FIFO order is
    /// preserved.
    pub async fn recv_from(&self) -> Option<(Vec<u8>, ClientId)> {
        self.recv_rx.lock().await.recv().await
    }

    /// The receive handle for `client`'s outbound queue.
    pub fn outgoing_queue(&self, client: ClientId) -> OutgoingQueue {
        let mut inner = self.lock();
        touch(&mut inner, client).outbound_rx.clone()
    }

    /// Placeholder address: no real socket is bound.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Shuts the fan-in down and releases every client's queues.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.recv_tx = None;
        inner.clients.clear();
    }

    pub(crate) fn reap_idle(&self) {
        let mut inner = self.lock();
        let timeout = self.idle_timeout;
        inner
            .clients
            .retain(|client, entry| {
                let stale = entry.last_activity.elapsed() > timeout;
                if stale {
                    log::debug!("discarding queues for idle client {}", client);
                }
                !stale
            });
    }
}

/// Looks up or creates the entry for `client` and refreshes its activity
/// timestamp.
fn touch(inner: &mut Inner, client: ClientId) -> &mut ClientEntry {
    let entry = inner.clients.entry(client).or_insert_with(|| {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        ClientEntry {
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            last_activity: Instant::now(),
        }
    });
    entry.last_activity = Instant::now();
    entry
}

async fn reap_loop(conn: Weak<QueuePacketConn>) {
    let period = match conn.upgrade() {
        Some(conn) => conn.idle_timeout / 2,
        None => return,
    };
    let mut tick = tokio::time::interval(period.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(conn) = conn.upgrade() else {
            return;
        };
        conn.reap_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ClientId {
        ClientId::from_bytes([n; 8])
    }

    #[test]
    fn client_id_from_payload() {
        let payload = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let (client, rest) = ClientId::from_payload(&payload).unwrap();
        assert_eq!(client, ClientId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(rest, &[9, 10]);
        assert!(ClientId::from_payload(&payload[..7]).is_none());
    }

    #[tokio::test]
    async fn inbound_order_preserved_per_client() {
        let conn = QueuePacketConn::new(Duration::from_secs(60));
        for i in 0..10u8 {
            conn.queue_incoming(&[i], id(1));
        }
        for i in 0..10u8 {
            let (p, client) = conn.recv_from().await.unwrap();
            assert_eq!(client, id(1));
            assert_eq!(p, vec![i]);
        }
    }

    #[tokio::test]
    async fn outbound_queues_are_independent() {
        let conn = QueuePacketConn::new(Duration::from_secs(60));
        conn.write_to(b"a", id(1));
        conn.write_to(b"b", id(2));
        let q1 = conn.outgoing_queue(id(1));
        let q2 = conn.outgoing_queue(id(2));
        assert_eq!(q1.lock().await.recv().await.unwrap(), b"a");
        assert_eq!(q2.lock().await.recv().await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let conn = QueuePacketConn::new(Duration::from_secs(60));
        for i in 0..2 * QUEUE_CAPACITY {
            conn.write_to(&(i as u32).to_be_bytes(), id(3));
        }
        let q = conn.outgoing_queue(id(3));
        let mut q = q.lock().await;
        let mut received = 0;
        while q.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, QUEUE_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_reaped() {
        let conn = QueuePacketConn::new(Duration::from_secs(2));
        conn.queue_incoming(b"hi", id(4));
        conn.write_to(b"yo", id(6));
        assert_eq!(conn.client_count(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        conn.reap_idle();
        assert_eq!(conn.client_count(), 2);
        tokio::time::advance(Duration::from_secs(2)).await;
        conn.reap_idle();
        assert_eq!(conn.client_count(), 0);
    }

    #[tokio::test]
    async fn closed_endpoint_discards() {
        let conn = QueuePacketConn::new(Duration::from_secs(60));
        conn.queue_incoming(b"live", id(5));
        conn.close();
        conn.queue_incoming(b"dead", id(5));
        assert_eq!(conn.recv_from().await.unwrap().0, b"live");
        assert!(conn.recv_from().await.is_none());
    }
}
