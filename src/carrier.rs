//! DNS query handler and response scheduler.
//!
//! The receive loop parses queries, validates them against the tunnel domain,
//! and splits each one into a response skeleton (handed to the send loop) and
//! zero or more upstream packets (fed to the packet endpoint). The send loop
//! answers one pending response at a time, packing whatever downstream
//! packets are ready into a single TXT answer under a one-second latency
//! budget.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base32::Alphabet;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::dns::{self, Message, Name, ResourceRecord};
use crate::framing::{self, BundleReader};
use crate::queue_conn::{ClientId, QueuePacketConn};

/// Largest UDP payload we will send: 1280 (minimum IPv6 MTU) minus 40 bytes
/// of IPv6 header and 8 bytes of UDP header. An EDNS buffer size of 1232
/// avoids fragmentation on nearly all current networks.
pub const MAX_UDP_PAYLOAD: usize = 1232;

/// Capacity of one TXT bundle. The Question section must be echoed, so the
/// room left for the answer varies per query; KCP needs one static maximum
/// instead. This keeps the whole response under MAX_UDP_PAYLOAD even for a
/// maximum-length question name: (1232 - 294) * 255/256, where 294 is the
/// wire size of a message with a 255-byte question name, a compressed-name
/// TXT answer with no data, and an EDNS OPT RR, and 255/256 is the TXT
/// character-string overhead, rounded down a little further.
pub const MAX_ENCODED_PAYLOAD: usize = 930;

/// TTL on TXT answers.
pub const RESPONSE_TTL: u32 = 60;

/// How long one response may wait for downstream data before going out
/// empty. Kept under the ~2 s query timeout of common recursive resolvers.
pub const MAX_RESPONSE_DELAY: Duration = Duration::from_secs(1);

/// Pending responses buffered between the receive and send loops.
const RESPONSE_CHANNEL_CAPACITY: usize = 100;

/// Smallest EDNS payload size a requestor may advertise; lower values are
/// treated as 512 (RFC 6891).
const MIN_EDNS_PAYLOAD: usize = 512;

/// A response set up by the receive loop, waiting for the send loop to
/// (possibly) fill its Answer section and emit it.
struct PendingResponse {
    resp: Message,
    addr: SocketAddr,
    client: ClientId,
}

/// The UDP-facing half of the tunnel server.
pub struct Carrier {
    socket: Arc<UdpSocket>,
    domain: Name,
    conn: Arc<QueuePacketConn>,
}

impl Carrier {
    pub fn new(socket: UdpSocket, domain: Name, conn: Arc<QueuePacketConn>) -> Carrier {
        Carrier {
            socket: Arc::new(socket),
            domain,
            conn,
        }
    }

    /// Runs the receive and send loops until a fatal socket error.
    pub async fn run(self) -> Result<()> {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let socket = self.socket.clone();
        let conn = self.conn.clone();
        tokio::spawn(async move {
            if let Err(e) = send_loop(socket, conn, rx).await {
                log::error!("send loop: {:#}", e);
            }
        });
        recv_loop(self.socket, self.domain, self.conn, tx).await
    }
}

/// Errors worth retrying the surrounding I/O loop for.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    )
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    domain: Name,
    conn: Arc<QueuePacketConn>,
    tx: mpsc::Sender<PendingResponse>,
) -> Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) if is_transient(&e) => {
                log::warn!("recv_from temporary error: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("recv_from"),
        };
        let query = match Message::from_wire(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("{}: cannot parse DNS query: {}", addr, e);
                continue;
            }
        };
        let (resp, client, payload) = build_response(&query, &domain);
        if let Some(resp) = resp {
            // Full channel means the send loop is saturated; the client will
            // requery.
            let _ = tx.try_send(PendingResponse { resp, addr, client });
        }
        // Discard padding and feed each bundled packet upward. A truncated
        // tail ends the bundle early.
        let mut reader = BundleReader::new(&payload);
        while let Ok(Some(packet)) = reader.next_packet() {
            conn.queue_incoming(packet, client);
        }
    }
}

/// Builds the response skeleton for one query and extracts its tunnel
/// payload, if any. Returns `None` in the first position for messages that
/// must not be answered at all.
fn build_response(query: &Message, domain: &Name) -> (Option<Message>, ClientId, Vec<u8>) {
    let client = ClientId::default();
    let mut resp = Message {
        id: query.id,
        flags: dns::FLAG_QR, // QR = 1, RCODE = no error
        question: query.question.clone(),
        ..Default::default()
    };

    if query.flags & dns::FLAG_QR != 0 {
        // Not a query; don't even respond.
        return (None, client, Vec::new());
    }

    // Include our own OPT RR only if the requestor sent one (RFC 6891: no
    // OPT in the request means no OPT in the response).
    let mut payload_size = 0usize;
    for rr in &query.additional {
        if rr.rtype != dns::RR_TYPE_OPT {
            continue;
        }
        if !resp.additional.is_empty() {
            // More than one OPT RR is FORMERR by definition.
            resp.flags |= dns::RCODE_FORMERR;
            log::debug!("FORMERR: more than one OPT RR");
            return (Some(resp), client, Vec::new());
        }
        resp.additional.push(ResourceRecord {
            name: Name::root(),
            rtype: dns::RR_TYPE_OPT,
            class: 4096, // our UDP payload size
            ttl: 0,
            data: Vec::new(),
        });

        let version = (rr.ttl >> 16) & 0xff;
        if version != 0 {
            // We only implement EDNS version 0; the extended RCODE is
            // split between the header nibble and the OPT TTL high bits.
            resp.flags |= dns::EXTENDED_RCODE_BADVERS & 0xf;
            resp.additional[0].ttl = (u32::from(dns::EXTENDED_RCODE_BADVERS) >> 4) << 24;
            log::debug!("BADVERS: EDNS version {} != 0", version);
            return (Some(resp), client, Vec::new());
        }
        payload_size = rr.class as usize;
    }
    if payload_size < MIN_EDNS_PAYLOAD {
        payload_size = MIN_EDNS_PAYLOAD;
    }
    // A too-small payload size will be FORMERR, but the name is checked
    // first so the response carries the right AA bit either way.

    if query.question.len() != 1 {
        resp.flags |= dns::RCODE_FORMERR;
        log::debug!("FORMERR: {} questions", query.question.len());
        return (Some(resp), client, Vec::new());
    }
    let question = &query.question[0];

    let prefix = match question.name.trim_suffix(domain) {
        Some(prefix) => {
            resp.flags |= dns::FLAG_AA;
            prefix
        }
        None => {
            resp.flags |= dns::RCODE_NXDOMAIN;
            log::debug!("NXDOMAIN: not authoritative for {}", question.name);
            return (Some(resp), client, Vec::new());
        }
    };

    if query.flags & dns::OPCODE_MASK != 0 {
        resp.flags |= dns::RCODE_NOTIMPL;
        log::debug!("NOTIMPL: unrecognized OPCODE {}", query.opcode());
        return (Some(resp), client, Vec::new());
    }

    if question.qtype != dns::RR_TYPE_TXT {
        resp.flags |= dns::RCODE_NXDOMAIN;
        log::debug!("NXDOMAIN: QTYPE {} != TXT", question.qtype);
        return (Some(resp), client, Vec::new());
    }

    // Join the prefix labels, uppercase, and base32-decode. Any decoding
    // problem looks like a nonexistent name.
    let mut encoded: Vec<u8> = Vec::new();
    for label in prefix.labels() {
        encoded.extend_from_slice(label);
    }
    encoded.make_ascii_uppercase();
    let payload = String::from_utf8(encoded)
        .ok()
        .and_then(|s| base32::decode(Alphabet::RFC4648 { padding: false }, &s));
    let payload = match payload {
        Some(p) => p,
        None => {
            resp.flags |= dns::RCODE_NXDOMAIN;
            log::debug!("NXDOMAIN: base32 decoding failed");
            return (Some(resp), client, Vec::new());
        }
    };

    let (client, rest) = match ClientId::from_payload(&payload) {
        Some(split) => split,
        None => {
            resp.flags |= dns::RCODE_NXDOMAIN;
            log::debug!(
                "NXDOMAIN: {} bytes are too short to contain a client ID",
                payload.len()
            );
            return (Some(resp), ClientId::default(), Vec::new());
        }
    };

    // Clients must advertise room for a full-sized response; otherwise the
    // transport MTU could never be honored.
    if payload_size < MAX_UDP_PAYLOAD {
        resp.flags |= dns::RCODE_FORMERR;
        log::debug!(
            "FORMERR: requestor payload size {} is too small (minimum {})",
            payload_size,
            MAX_UDP_PAYLOAD
        );
        return (Some(resp), client, Vec::new());
    }

    (Some(resp), client, rest.to_vec())
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    conn: Arc<QueuePacketConn>,
    mut rx: mpsc::Receiver<PendingResponse>,
) -> Result<()> {
    // A response that arrived while assembling the previous bundle, and a
    // packet that was dequeued but did not fit.
    let mut next_rec: Option<PendingResponse> = None;
    let mut next_p: Option<Vec<u8>> = None;
    loop {
        let mut rec = match next_rec.take() {
            Some(rec) => rec,
            None => match rx.recv().await {
                Some(rec) => rec,
                None => break,
            },
        };

        if rec.resp.rcode() == dns::RCODE_NOERROR && rec.resp.question.len() == 1 {
            // Non-error response: fill the Answer section with downstream
            // packets.
            let question = &rec.resp.question[0];
            let mut answer = ResourceRecord {
                name: question.name.clone(),
                rtype: question.qtype,
                class: question.class,
                ttl: RESPONSE_TTL,
                data: Vec::new(), // filled in below
            };

            let mut bundle = Vec::new();
            let mut limit = MAX_ENCODED_PAYLOAD;
            if let Some(p) = next_p.take() {
                // No length check on a packet left over from the previous
                // bundle; if it is somehow too large, truncation below
                // drops it.
                limit = limit.saturating_sub(2 + p.len());
                framing::append_packet(&mut bundle, &p);
            }

            let queue = conn.outgoing_queue(rec.client);
            let mut queue = queue.lock().await;
            let delay = tokio::time::sleep(MAX_RESPONSE_DELAY);
            tokio::pin!(delay);
            // Only the first packet of a bundle is worth waiting for; later
            // ones must be ready immediately or they ride the next response.
            let mut waited = false;
            loop {
                match queue.try_recv() {
                    Ok(p) => {
                        waited = true;
                        if 2 + p.len() > limit {
                            // Save for the next response.
                            next_p = Some(p);
                            break;
                        }
                        limit -= 2 + p.len();
                        framing::append_packet(&mut bundle, &p);
                    }
                    Err(TryRecvError::Empty) => {
                        if waited {
                            break;
                        }
                        tokio::select! {
                            maybe = queue.recv() => match maybe {
                                Some(p) => {
                                    waited = true;
                                    if 2 + p.len() > limit {
                                        next_p = Some(p);
                                        break;
                                    }
                                    limit -= 2 + p.len();
                                    framing::append_packet(&mut bundle, &p);
                                }
                                None => break,
                            },
                            maybe = rx.recv() => {
                                // Another response is waiting; stop stalling
                                // this one.
                                next_rec = maybe;
                                break;
                            }
                            _ = &mut delay => break,
                        }
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            }

            answer.data = dns::encode_rdata_txt(&bundle);
            rec.resp.answer = vec![answer];
        }

        let mut wire = match rec.resp.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                log::warn!("response serialization: {}", e);
                continue;
            }
        };
        if wire.len() > MAX_UDP_PAYLOAD {
            wire.truncate(MAX_UDP_PAYLOAD);
            wire[2] |= (dns::FLAG_TC >> 8) as u8;
        }
        match socket.send_to(&wire, rec.addr).await {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {
                log::warn!("send_to temporary error: {}", e);
            }
            Err(e) => return Err(e).context("send_to"),
        }
    }
    Ok(())
}
