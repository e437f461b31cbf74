//! Session wiring: KCP accept loop, Noise handshake, stream multiplexer,
//! and stream dispatch.
//!
//! Each accepted KCP session gets its own task tree: a Noise responder
//! handshake, a pair of pump tasks moving plaintext between the Noise channel
//! and an in-process pipe, an smux server on the pipe, and one bridge task
//! per accepted stream. A failure anywhere in one tree tears down that
//! session only.

use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_smux::MuxBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::bridge;
use crate::config::IDLE_TIMEOUT;
use crate::noise::{self, NoiseChannel};
use crate::queue_conn::QueuePacketConn;
use crate::transport::{KcpListener, KcpSession};

/// Buffered plaintext between the mux and the Noise pumps.
const PIPE_BUFFER: usize = 64 * 1024;

/// Largest plaintext read pushed into one Noise frame.
const PUMP_CHUNK: usize = 16 * 1024;

/// Accepts reliable sessions on the packet endpoint and runs the session
/// stack over each one.
pub struct SessionFabric {
    conn: Arc<QueuePacketConn>,
    privkey: Vec<u8>,
    upstream: SocketAddr,
}

impl SessionFabric {
    pub fn new(conn: Arc<QueuePacketConn>, privkey: Vec<u8>, upstream: SocketAddr) -> SessionFabric {
        SessionFabric {
            conn,
            privkey,
            upstream,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = KcpListener::new(self.conn.clone());
        while let Some(session) = listener.accept().await {
            log::info!("begin session {:08x}", session.conv());
            let privkey = self.privkey.clone();
            let upstream = self.upstream;
            tokio::spawn(async move {
                if let Err(e) = handle_session(session.clone(), privkey, upstream).await {
                    log::info!("session {:08x}: {:#}", session.conv(), e);
                }
                log::info!("end session {:08x}", session.conv());
                session.close();
            });
        }
        Ok(())
    }
}

/// Couples an established Noise channel to an in-process byte pipe and
/// returns the other end of the pipe. Plaintext written to the returned
/// stream is encrypted onto the session; decrypted session frames come back
/// out of it. Both pumps stop when either side closes.
pub fn plaintext_pipe(session: Arc<KcpSession>, channel: Arc<NoiseChannel>) -> DuplexStream {
    let (pipe, pump_side) = tokio::io::duplex(PIPE_BUFFER);
    let (mut plain_in, mut plain_out) = tokio::io::split(pump_side);

    // Downstream direction: pipe -> encrypt -> session.
    {
        let session = session.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                match plain_in.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = channel.write_frame(&*session, &buf[..n]).await {
                            log::debug!("session {:08x} write: {:#}", session.conv(), e);
                            break;
                        }
                    }
                }
            }
        });
    }

    // Upstream direction: session -> decrypt -> pipe. Dropping the write
    // half on exit is what ends the mux on the other side of the pipe.
    tokio::spawn(async move {
        loop {
            match channel.read_frame(&*session).await {
                Ok(plaintext) => {
                    if plain_out.write_all(&plaintext).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("session {:08x} read: {:#}", session.conv(), e);
                    break;
                }
            }
        }
    });

    pipe
}

async fn handle_session(
    session: Arc<KcpSession>,
    privkey: Vec<u8>,
    upstream: SocketAddr,
) -> Result<()> {
    let channel = noise::responder_handshake(&*session, &privkey)
        .await
        .context("noise handshake")?;
    let pipe = plaintext_pipe(session.clone(), Arc::new(channel));

    let mut builder = MuxBuilder::server();
    builder.with_keep_alive_interval(
        NonZeroU64::new(IDLE_TIMEOUT.as_secs()).expect("IDLE_TIMEOUT is non-zero"),
    );
    let (_connector, mut acceptor, worker) = builder.with_connection(pipe).build();
    tokio::spawn(worker);

    let conv = session.conv();
    let mut stream_seq: u32 = 0;
    while let Some(stream) = acceptor.accept().await {
        let seq = stream_seq;
        stream_seq = stream_seq.wrapping_add(1);
        tokio::spawn(async move {
            log::info!("begin stream {:08x}:{}", conv, seq);
            if let Err(e) = bridge::handle_stream(stream, upstream).await {
                log::info!("stream {:08x}:{}: {:#}", conv, seq, e);
            }
            log::info!("end stream {:08x}:{}", conv, seq);
        });
    }
    Ok(())
}
