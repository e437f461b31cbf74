//! Reliable ARQ sessions over the virtual packet endpoint.
//!
//! Each client id owns at most one KCP conversation. [`KcpListener`] drains
//! [`QueuePacketConn::recv_from`] and routes datagrams into per-client
//! [`KcpSession`]s, creating and handing out a new session the first time a
//! client id is seen. Sessions run in stream mode with the congestion window
//! disabled; the carrier's one-response-per-query cadence is the real rate
//! limiter.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kcp::Kcp;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::carrier::MAX_ENCODED_PAYLOAD;
use crate::noise::Link;
use crate::queue_conn::{ClientId, QueuePacketConn};

/// KCP segment MTU. Every segment must fit in a TXT bundle behind its 2-byte
/// length prefix.
pub const SEGMENT_MTU: usize = MAX_ENCODED_PAYLOAD - 2;

/// Static send/receive windows, in segments.
const WINDOW_SIZE: u16 = 128;

/// How often the protocol clock ticks for retransmission and ACK flushing.
const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Sends stall once this many segments are waiting, until the window drains.
const SEND_BACKLOG: usize = 1024;

/// Sink for KCP's raw segments: each one becomes a datagram queued for the
/// carrier to bundle into a TXT response. Drop-on-full comes for free from
/// the queue.
struct QueueOutput {
    conn: Arc<QueuePacketConn>,
    client: ClientId,
}

impl Write for QueueOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write_to(buf, self.client);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One reliable conversation with one client.
pub struct KcpSession {
    conv: u32,
    client: ClientId,
    kcp: Mutex<Kcp<QueueOutput>>,
    readable: Notify,
    closed: AtomicBool,
    epoch: Instant,
}

impl KcpSession {
    /// Creates a session and starts its update task. Fails if the segment
    /// MTU is outside what KCP accepts.
    pub fn spawn(
        conv: u32,
        client: ClientId,
        conn: Arc<QueuePacketConn>,
    ) -> io::Result<Arc<KcpSession>> {
        let output = QueueOutput { conn, client };
        let mut kcp = Kcp::new_stream(conv, output);
        // Default retransmission timing, but congestion window off: the
        // static windows are the only limit.
        kcp.set_nodelay(false, UPDATE_INTERVAL.as_millis() as i32, 0, true);
        kcp.set_wndsize(WINDOW_SIZE, WINDOW_SIZE);
        kcp.set_mtu(SEGMENT_MTU)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{:?}", e)))?;
        let session = Arc::new(KcpSession {
            conv,
            client,
            kcp: Mutex::new(kcp),
            readable: Notify::new(),
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
        });
        tokio::spawn(session.clone().update_loop());
        Ok(session)
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_one();
    }

    fn clock(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Feeds one raw datagram into the conversation.
    pub async fn input(&self, packet: &[u8]) {
        let mut kcp = self.kcp.lock().await;
        match kcp.input(packet) {
            Ok(_) => {}
            Err(e) => {
                log::debug!("session {:08x} kcp input: {:?}", self.conv, e);
                return;
            }
        }
        drop(kcp);
        self.readable.notify_one();
    }

    /// Receives the next run of stream bytes. Returns `Ok(0)` once the
    /// session is closed.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.readable.notified();
            {
                let mut kcp = self.kcp.lock().await;
                match kcp.recv(buf) {
                    Ok(n) => return Ok(n),
                    Err(kcp::Error::RecvQueueEmpty) => {}
                    Err(e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!("kcp recv: {:?}", e),
                        ))
                    }
                }
            }
            if self.is_closed() {
                return Ok(0);
            }
            notified.await;
        }
    }

    /// Fills `buf` completely or fails with `UnexpectedEof`.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv(&mut buf[filled..]).await? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Queues `data` for reliable delivery, waiting out any send backlog.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        loop {
            {
                let mut kcp = self.kcp.lock().await;
                if self.is_closed() {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
                if kcp.wait_snd() < SEND_BACKLOG {
                    kcp.send(data).map_err(|e| {
                        io::Error::new(io::ErrorKind::Other, format!("kcp send: {:?}", e))
                    })?;
                    // Push the fresh segments out without waiting for the
                    // next clock tick.
                    let _ = kcp.flush();
                    return Ok(());
                }
            }
            tokio::time::sleep(UPDATE_INTERVAL).await;
        }
    }

    async fn update_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(UPDATE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if self.is_closed() {
                return;
            }
            let mut kcp = self.kcp.lock().await;
            let clock = self.clock();
            if let Err(e) = kcp.update(clock) {
                log::debug!("session {:08x} kcp update: {:?}", self.conv, e);
                drop(kcp);
                self.close();
                return;
            }
            if kcp.is_dead_link() {
                log::info!("session {:08x} dead link", self.conv);
                drop(kcp);
                self.close();
                return;
            }
        }
    }
}

impl Link for KcpSession {
    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        self.recv_exact(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.send(buf).await
    }
}

/// The conversation id is the first field of every KCP segment,
/// little-endian.
fn packet_conv(packet: &[u8]) -> Option<u32> {
    let bytes = packet.get(..4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Accepts one [`KcpSession`] per client id seen on the packet endpoint.
pub struct KcpListener {
    accept_rx: Mutex<mpsc::Receiver<Arc<KcpSession>>>,
}

impl KcpListener {
    pub fn new(conn: Arc<QueuePacketConn>) -> KcpListener {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        tokio::spawn(demux_loop(conn, accept_tx));
        KcpListener {
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// The next newly created session, or `None` once the endpoint closes.
    pub async fn accept(&self) -> Option<Arc<KcpSession>> {
        self.accept_rx.lock().await.recv().await
    }
}

async fn demux_loop(conn: Arc<QueuePacketConn>, accept_tx: mpsc::Sender<Arc<KcpSession>>) {
    use std::collections::hash_map::Entry;

    let mut sessions: std::collections::HashMap<ClientId, Arc<KcpSession>> =
        std::collections::HashMap::new();
    while let Some((packet, client)) = conn.recv_from().await {
        // Drop dead sessions so a returning client can start over.
        let stale = sessions.get(&client).is_some_and(|s| s.is_closed());
        if stale {
            sessions.remove(&client);
        }
        let session = match sessions.entry(client) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let Some(conv) = packet_conv(&packet) else {
                    log::debug!("client {} runt packet ({} bytes)", client, packet.len());
                    continue;
                };
                let session = match KcpSession::spawn(conv, client, conn.clone()) {
                    Ok(session) => session,
                    Err(e) => {
                        log::warn!("client {} session setup: {}", client, e);
                        continue;
                    }
                };
                if accept_tx.try_send(session.clone()).is_err() {
                    // Accept backlog full or listener gone; the client will
                    // retransmit and try again.
                    session.close();
                    continue;
                }
                entry.insert(session.clone());
                session
            }
        };
        session.input(&packet).await;
    }
    // Endpoint closed: tear the sessions down with it.
    for session in sessions.values() {
        session.close();
    }
}
