//! Packet bundling inside opaque byte strings.
//!
//! Upstream bundles (decoded from query names) use a one-byte prefix: values
//! 0..=223 introduce a packet of that many bytes, values 224..=255 introduce
//! `n - 224` bytes of padding to skip. Downstream bundles (carried in TXT
//! answers) use a two-byte big-endian length per packet, because KCP segments
//! exceed the one-byte inline limit.

use thiserror::Error;

/// Prefix values at or above this mark padding rather than a packet length.
const PADDING_BASE: u8 = 224;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bundle truncated mid-packet")]
pub struct Truncated;

/// Reads packets out of an upstream bundle.
pub struct BundleReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BundleReader<'a> {
    pub fn new(buf: &'a [u8]) -> BundleReader<'a> {
        BundleReader { buf, pos: 0 }
    }

    /// Returns the next packet, `Ok(None)` at a clean end of bundle, or
    /// [`Truncated`] if the bundle ends inside a packet body or padding run.
    pub fn next_packet(&mut self) -> Result<Option<&'a [u8]>, Truncated> {
        loop {
            let prefix = match self.buf.get(self.pos) {
                Some(&b) => b,
                None => return Ok(None),
            };
            self.pos += 1;
            if prefix >= PADDING_BASE {
                let skip = (prefix - PADDING_BASE) as usize;
                if self.pos + skip > self.buf.len() {
                    return Err(Truncated);
                }
                self.pos += skip;
                continue;
            }
            let len = prefix as usize;
            if self.pos + len > self.buf.len() {
                return Err(Truncated);
            }
            let packet = &self.buf[self.pos..self.pos + len];
            self.pos += len;
            return Ok(Some(packet));
        }
    }
}

/// Appends one downstream packet to a bundle as a 2-byte big-endian length
/// followed by its bytes.
pub fn append_packet(bundle: &mut Vec<u8>, packet: &[u8]) {
    debug_assert!(packet.len() <= u16::MAX as usize);
    bundle.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    bundle.extend_from_slice(packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buf: &[u8]) -> Result<Vec<Vec<u8>>, Truncated> {
        let mut r = BundleReader::new(buf);
        let mut out = Vec::new();
        while let Some(p) = r.next_packet()? {
            out.push(p.to_vec());
        }
        Ok(out)
    }

    #[test]
    fn empty_bundle() {
        assert_eq!(collect(&[]).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn packets_and_padding() {
        // Two packets separated by a 3-byte padding run.
        let buf = [3, b'a', b'b', b'c', 227, 0, 0, 0, 2, b'x', b'y'];
        assert_eq!(collect(&buf).unwrap(), vec![b"abc".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn zero_length_packet() {
        let buf = [0, 1, b'z'];
        assert_eq!(collect(&buf).unwrap(), vec![Vec::new(), b"z".to_vec()]);
    }

    #[test]
    fn trailing_padding_is_clean_eof() {
        let buf = [1, b'q', 226, 0, 0];
        assert_eq!(collect(&buf).unwrap(), vec![b"q".to_vec()]);
    }

    #[test]
    fn truncated_body() {
        let buf = [5, b'a', b'b'];
        assert_eq!(collect(&buf), Err(Truncated));
    }

    #[test]
    fn truncated_padding() {
        let buf = [1, b'a', 230, 0];
        assert_eq!(collect(&buf), Err(Truncated));
    }

    #[test]
    fn downstream_framing_round_trip() {
        let packets = [b"one".as_slice(), b"".as_slice(), b"three".as_slice()];
        let mut bundle = Vec::new();
        for p in packets {
            append_packet(&mut bundle, p);
        }
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < bundle.len() {
            let len = u16::from_be_bytes([bundle[pos], bundle[pos + 1]]) as usize;
            pos += 2;
            out.push(bundle[pos..pos + len].to_vec());
            pos += len;
        }
        assert_eq!(out, packets.map(|p| p.to_vec()).to_vec());
    }
}
