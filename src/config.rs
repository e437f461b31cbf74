//! Server configuration and startup invariant checks.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::dns::{Name, MAX_NAME_LEN};
use crate::noise::KEY_LEN;
use crate::queue_conn::ClientId;
use crate::transport::SEGMENT_MTU;

/// Sessions and client queues idle longer than this are considered dead.
/// Queue eviction runs at twice this value; the mux keepalive uses it
/// directly.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("private key is {0} bytes, expected {KEY_LEN}")]
    KeyLength(usize),
    #[error("domain {0} leaves no query-name room for tunnel payloads")]
    DomainTooLong(Name),
    #[error("transport MTU {0} rejected: {1}")]
    Mtu(usize, String),
}

/// Everything the serve loop needs, validated before any socket is bound.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub udp_addr: SocketAddr,
    pub domain: Name,
    pub upstream_addr: SocketAddr,
    pub privkey: Vec<u8>,
}

impl ServerConfig {
    /// Checks the invariants that would otherwise surface mid-serve: the key
    /// length, the query-name headroom under `domain`, and KCP's acceptance
    /// of the segment MTU implied by the bundle capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.privkey.len() != KEY_LEN {
            return Err(ConfigError::KeyLength(self.privkey.len()));
        }
        if max_name_payload(&self.domain) < ClientId::LEN + 1 {
            return Err(ConfigError::DomainTooLong(self.domain.clone()));
        }
        let mut probe = kcp::Kcp::new_stream(0, std::io::sink());
        probe
            .set_mtu(SEGMENT_MTU)
            .map_err(|e| ConfigError::Mtu(SEGMENT_MTU, format!("{:?}", e)))?;
        Ok(())
    }
}

/// How many payload bytes a client can base32-encode into the labels of one
/// query name under `domain`: the name budget minus the domain's wire size,
/// minus one length byte per 63-byte label.
pub fn max_name_payload(domain: &Name) -> usize {
    let budget = MAX_NAME_LEN.saturating_sub(domain.wire_len());
    let mut chars = 0usize;
    while chars < budget {
        let labels = (chars + 1).div_ceil(63);
        if chars + 1 + labels > budget {
            break;
        }
        chars += 1;
    }
    chars * 5 / 8
}
