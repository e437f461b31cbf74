//! Noise_NK encrypted channel over a reliable byte link.
//!
//! The responder's static key authenticates the server; the initiator stays
//! anonymous. Handshake and transport messages alike ride the link framed as
//! a 2-byte big-endian length followed by ciphertext, so the channel works
//! over anything that can move ordered bytes.

use std::io;

use anyhow::{anyhow, Context, Result};
use snow::params::NoiseParams;
use snow::{Builder, TransportState};
use tokio::sync::Mutex;

/// The one protocol this tunnel speaks.
pub const NOISE_PARAMS: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// X25519 key length.
pub const KEY_LEN: usize = 32;

/// Largest framed message, ciphertext inclusive.
const MAX_FRAME: usize = 65535;
/// AEAD tag overhead per transport message.
const TAG_LEN: usize = 16;

/// An ordered, reliable byte link a Noise channel can run over.
#[allow(async_fn_in_trait)]
pub trait Link {
    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()>;
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;
}

async fn read_frame<L: Link>(link: &L) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    link.read_exact(&mut len)
        .await
        .context("reading frame length")?;
    let len = u16::from_be_bytes(len) as usize;
    let mut frame = vec![0u8; len];
    link.read_exact(&mut frame)
        .await
        .context("reading frame body")?;
    Ok(frame)
}

async fn write_frame<L: Link>(link: &L, frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_FRAME {
        return Err(anyhow!("frame too large: {}", frame.len()));
    }
    // One buffer per frame so the length prefix and body hit the link as a
    // unit.
    let mut buf = Vec::with_capacity(2 + frame.len());
    buf.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    buf.extend_from_slice(frame);
    link.write_all(&buf).await.context("writing frame")?;
    Ok(())
}

fn params() -> Result<NoiseParams> {
    NOISE_PARAMS
        .parse()
        .map_err(|e| anyhow!("noise params: {:?}", e))
}

/// The transport half of an established Noise session. Both pump directions
/// share it; each operation locks just long enough to run the cipher.
pub struct NoiseChannel {
    transport: Mutex<TransportState>,
}

impl NoiseChannel {
    /// Reads and decrypts one message from the link.
    pub async fn read_frame<L: Link>(&self, link: &L) -> Result<Vec<u8>> {
        let ciphertext = read_frame(link).await?;
        let mut plaintext = vec![0u8; ciphertext.len()];
        let n = self
            .transport
            .lock()
            .await
            .read_message(&ciphertext, &mut plaintext)
            .context("noise decrypt")?;
        plaintext.truncate(n);
        Ok(plaintext)
    }

    /// Encrypts and writes one message to the link.
    pub async fn write_frame<L: Link>(&self, link: &L, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_FRAME - TAG_LEN {
            return Err(anyhow!("message too large: {}", plaintext.len()));
        }
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        let n = self
            .transport
            .lock()
            .await
            .write_message(plaintext, &mut ciphertext)
            .context("noise encrypt")?;
        ciphertext.truncate(n);
        write_frame(link, &ciphertext).await
    }
}

/// Runs the responder side of the NK handshake, authenticated by the
/// server's static private key.
pub async fn responder_handshake<L: Link>(link: &L, privkey: &[u8]) -> Result<NoiseChannel> {
    let mut hs = Builder::new(params()?)
        .local_private_key(privkey)
        .build_responder()
        .context("building noise responder")?;
    let mut buf = vec![0u8; MAX_FRAME];

    // <- e, es
    let msg = read_frame(link).await?;
    hs.read_message(&msg, &mut buf)
        .context("reading handshake initiation")?;
    // -> e, ee
    let n = hs
        .write_message(&[], &mut buf)
        .context("writing handshake response")?;
    write_frame(link, &buf[..n]).await?;

    let transport = hs.into_transport_mode().context("entering transport mode")?;
    Ok(NoiseChannel {
        transport: Mutex::new(transport),
    })
}

/// Runs the initiator side of the NK handshake against a known server
/// public key.
pub async fn initiator_handshake<L: Link>(link: &L, server_pubkey: &[u8]) -> Result<NoiseChannel> {
    let mut hs = Builder::new(params()?)
        .remote_public_key(server_pubkey)
        .build_initiator()
        .context("building noise initiator")?;
    let mut buf = vec![0u8; MAX_FRAME];

    // -> e, es
    let n = hs
        .write_message(&[], &mut buf)
        .context("writing handshake initiation")?;
    write_frame(link, &buf[..n]).await?;
    // <- e, ee
    let msg = read_frame(link).await?;
    hs.read_message(&msg, &mut buf)
        .context("reading handshake response")?;

    let transport = hs.into_transport_mode().context("entering transport mode")?;
    Ok(NoiseChannel {
        transport: Mutex::new(transport),
    })
}
