//! Bridges one accepted tunnel stream to one upstream TCP connection.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Copies bytes between `stream` and a fresh connection to `upstream` until
/// both directions have finished. When one direction's copy ends, its
/// destination's write side is shut down, so a half-close propagates across
/// the bridge instead of stranding the peer.
pub async fn handle_stream<S>(stream: S, upstream: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let conn = TcpStream::connect(upstream)
        .await
        .context("connect upstream")?;

    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let (mut conn_rd, mut conn_wr) = conn.into_split();

    let outbound = async {
        let copied = tokio::io::copy(&mut stream_rd, &mut conn_wr).await;
        let _ = conn_wr.shutdown().await;
        copied
    };
    let inbound = async {
        let copied = tokio::io::copy(&mut conn_rd, &mut stream_wr).await;
        let _ = stream_wr.shutdown().await;
        copied
    };
    let (outbound, inbound) = tokio::join!(outbound, inbound);

    if let Err(e) = outbound {
        log::debug!("copy upstream<-stream: {}", e);
    }
    if let Err(e) = inbound {
        log::debug!("copy stream<-upstream: {}", e);
    }
    Ok(())
}
