//! Carrier behavior over a real UDP socket: wire-level RCODE handling,
//! response coalescing, and the empty-response latency bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base32::Alphabet;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use burrow::dns::{self, Message, Name, Question, ResourceRecord};
use burrow::{Carrier, ClientId, QueuePacketConn};

async fn start_carrier(domain: &str) -> (SocketAddr, Arc<QueuePacketConn>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let conn = QueuePacketConn::new(Duration::from_secs(120));
    let carrier = Carrier::new(socket, Name::parse(domain).unwrap(), conn.clone());
    tokio::spawn(carrier.run());
    (addr, conn)
}

fn opt_rr(payload_size: u16) -> ResourceRecord {
    ResourceRecord {
        name: Name::root(),
        rtype: dns::RR_TYPE_OPT,
        class: payload_size,
        ttl: 0,
        data: Vec::new(),
    }
}

/// Encodes `payload` into tunnel labels below `domain`.
fn tunnel_name(payload: &[u8], domain: &str) -> Name {
    let encoded = base32::encode(Alphabet::RFC4648 { padding: false }, payload);
    let mut labels: Vec<Vec<u8>> = encoded.as_bytes().chunks(57).map(|c| c.to_vec()).collect();
    labels.extend(Name::parse(domain).unwrap().labels().iter().cloned());
    Name::from_labels(labels).unwrap()
}

fn query_for(name: Name, payload_size: u16) -> Message {
    Message {
        id: 0x7a31,
        flags: 0,
        question: vec![Question {
            name,
            qtype: dns::RR_TYPE_TXT,
            class: dns::CLASS_IN,
        }],
        additional: vec![opt_rr(payload_size)],
        ..Default::default()
    }
}

async fn exchange(server: SocketAddr, query: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query.to_wire().unwrap(), server)
        .await
        .unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no response within 5s")
        .unwrap();
    Message::from_wire(&buf[..n]).unwrap()
}

/// Splits a TXT bundle back into its length-prefixed packets.
fn unbundle(answer: &ResourceRecord) -> Vec<Vec<u8>> {
    let bundle = dns::decode_rdata_txt(&answer.data).unwrap();
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < bundle.len() {
        let len = u16::from_be_bytes([bundle[pos], bundle[pos + 1]]) as usize;
        pos += 2;
        packets.push(bundle[pos..pos + len].to_vec());
        pos += len;
    }
    packets
}

#[tokio::test]
async fn foreign_suffix_gets_nxdomain() {
    let (server, _conn) = start_carrier("t.example.com").await;
    let query = query_for(Name::parse("abc.other.com").unwrap(), 4096);
    let resp = exchange(server, &query).await;

    assert_eq!(resp.id, query.id);
    assert_eq!(resp.flags & dns::FLAG_QR, dns::FLAG_QR);
    assert_eq!(resp.flags & dns::FLAG_AA, 0);
    assert_eq!(resp.rcode(), dns::RCODE_NXDOMAIN);
    assert_eq!(resp.question, query.question);
    assert_eq!(resp.additional.len(), 1);
    assert_eq!(resp.additional[0].rtype, dns::RR_TYPE_OPT);
    assert_eq!(resp.additional[0].class, 4096);
    assert!(resp.answer.is_empty());
}

#[tokio::test]
async fn small_edns_buffer_gets_formerr() {
    let (server, conn) = start_carrier("t.example.com").await;
    let mut payload = b"clientid".to_vec();
    payload.extend_from_slice(b"extra");
    let query = query_for(tunnel_name(&payload, "t.example.com"), 512);
    let resp = exchange(server, &query).await;

    assert_eq!(resp.flags & dns::FLAG_AA, dns::FLAG_AA);
    assert_eq!(resp.rcode(), dns::RCODE_FORMERR);
    assert_eq!(resp.additional.len(), 1);
    // Nothing may reach the packet layer for a rejected query.
    assert!(
        timeout(Duration::from_millis(200), conn.recv_from())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn queued_packets_coalesce_into_one_response() {
    let (server, conn) = start_carrier("t.example.com").await;
    let client = ClientId::from_bytes(*b"clientid");
    let packets: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i; 100]).collect();
    for p in &packets {
        conn.write_to(p, client);
    }

    let query = query_for(tunnel_name(b"clientid", "t.example.com"), 4096);
    let resp = exchange(server, &query).await;

    assert_eq!(resp.rcode(), dns::RCODE_NOERROR);
    assert_eq!(resp.answer.len(), 1);
    let answer = &resp.answer[0];
    assert_eq!(answer.rtype, dns::RR_TYPE_TXT);
    assert_eq!(answer.ttl, 60);
    assert_eq!(answer.name, query.question[0].name);
    assert_eq!(unbundle(answer), packets);
}

#[tokio::test]
async fn idle_client_gets_empty_response_within_budget() {
    let (server, _conn) = start_carrier("t.example.com").await;
    let query = query_for(tunnel_name(b"clientid", "t.example.com"), 4096);

    let started = Instant::now();
    let resp = exchange(server, &query).await;
    let elapsed = started.elapsed();

    assert_eq!(resp.rcode(), dns::RCODE_NOERROR);
    assert_eq!(resp.answer.len(), 1);
    assert!(unbundle(&resp.answer[0]).is_empty());
    // One response-delay budget plus slack.
    assert!(elapsed < Duration::from_millis(1900), "took {:?}", elapsed);
}

#[tokio::test]
async fn carried_packets_arrive_in_order() {
    let (server, conn) = start_carrier("t.example.com").await;
    let mut payload = b"clientid".to_vec();
    // Three inline-framed packets with a padding run mixed in.
    payload.push(3);
    payload.extend_from_slice(b"abc");
    payload.push(226); // 2 bytes of padding
    payload.extend_from_slice(&[0, 0]);
    payload.push(0); // empty packet
    payload.push(2);
    payload.extend_from_slice(b"xy");

    let query = query_for(tunnel_name(&payload, "t.example.com"), 4096);
    let _resp = exchange(server, &query).await;

    let expect: [&[u8]; 3] = [b"abc", b"", b"xy"];
    for want in expect {
        let (packet, client) = timeout(Duration::from_secs(2), conn.recv_from())
            .await
            .expect("packet not enqueued")
            .unwrap();
        assert_eq!(client, ClientId::from_bytes(*b"clientid"));
        assert_eq!(packet, want);
    }
}

#[tokio::test]
async fn responses_stay_within_the_datagram_limit() {
    let (server, conn) = start_carrier("t.example.com").await;
    let client = ClientId::from_bytes(*b"clientid");
    // More queued data than one bundle can carry.
    for i in 0u8..4 {
        conn.write_to(&vec![i; 400], client);
    }

    let query = query_for(tunnel_name(b"clientid", "t.example.com"), 4096);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query.to_wire().unwrap(), server)
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert!(n <= burrow::MAX_UDP_PAYLOAD);
    let resp = Message::from_wire(&buf[..n]).unwrap();
    // Two 400-byte packets fit under the bundle capacity; the rest wait.
    assert_eq!(unbundle(&resp.answer[0]).len(), 2);
}
