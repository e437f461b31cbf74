//! DNS wire codec.
//!
//! Minimal message parsing and serialization for the subset of DNS the tunnel
//! carrier needs: one question, TXT answers, and EDNS(0) OPT records kept as
//! plain resource records so the carrier can inspect and echo them itself.
//! Names support compression pointers on input; on output the answer name is
//! compressed to a pointer at the question name whenever the two are equal,
//! which is what keeps a full-size response inside one UDP payload.

use std::fmt;

use thiserror::Error;

pub const RR_TYPE_TXT: u16 = 16;
pub const RR_TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;
pub const FLAG_TC: u16 = 0x0200;
pub const OPCODE_MASK: u16 = 0x7800;
pub const RCODE_MASK: u16 = 0x000f;

pub const RCODE_NOERROR: u16 = 0;
pub const RCODE_FORMERR: u16 = 1;
pub const RCODE_SERVFAIL: u16 = 2;
pub const RCODE_NXDOMAIN: u16 = 3;
pub const RCODE_NOTIMPL: u16 = 4;
/// Extended RCODE, split between the header's low nibble and the high bits of
/// the OPT TTL (RFC 6891).
pub const EXTENDED_RCODE_BADVERS: u16 = 16;

/// Maximum length of a DNS name in wire form.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

const HEADER_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,
    #[error("label longer than {MAX_LABEL_LEN} bytes")]
    LabelTooLong,
    #[error("name longer than {MAX_NAME_LEN} bytes")]
    NameTooLong,
    #[error("bad compression pointer")]
    BadPointer,
    #[error("empty label")]
    EmptyLabel,
    #[error("rdata longer than 65535 bytes")]
    RdataTooLong,
    #[error("too many records for one message")]
    TooManyRecords,
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// A DNS name: a sequence of labels, stored without the root terminator.
///
/// Comparison of names for suffix trimming and compression is ASCII
/// case-insensitive; the stored labels keep the case they arrived with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name(Vec<Vec<u8>>);

impl Name {
    /// The root name (zero labels).
    pub fn root() -> Name {
        Name(Vec::new())
    }

    pub fn from_labels(labels: Vec<Vec<u8>>) -> Result<Name, DnsError> {
        let name = Name(labels);
        name.check()?;
        Ok(name)
    }

    /// Parses a name from dotted text. A single trailing dot is accepted.
    pub fn parse(s: &str) -> Result<Name, DnsError> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Name::root());
        }
        let mut labels = Vec::new();
        for label in s.split('.') {
            if label.is_empty() {
                return Err(DnsError::EmptyLabel);
            }
            labels.push(label.as_bytes().to_vec());
        }
        Name::from_labels(labels)
    }

    fn check(&self) -> Result<(), DnsError> {
        for label in &self.0 {
            if label.is_empty() {
                return Err(DnsError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(DnsError::LabelTooLong);
            }
        }
        if self.wire_len() > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        Ok(())
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Length of this name in uncompressed wire form, including the root byte.
    pub fn wire_len(&self) -> usize {
        self.0.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    fn eq_ignore_case(a: &[Vec<u8>], b: &[Vec<u8>]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.eq_ignore_ascii_case(y))
    }

    /// If this name ends with `suffix` (case-insensitive), returns the labels
    /// that precede it.
    pub fn trim_suffix(&self, suffix: &Name) -> Option<Name> {
        if suffix.0.len() > self.0.len() {
            return None;
        }
        let split = self.0.len() - suffix.0.len();
        if !Self::eq_ignore_case(&self.0[split..], &suffix.0) {
            return None;
        }
        Some(Name(self.0[..split].to_vec()))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            for &b in label {
                // Escape anything that would not survive a round trip through
                // dotted text.
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:03}", b)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub class: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    /// Raw RDATA bytes; this codec does not interpret them.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub question: Vec<Question>,
    pub answer: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    pub fn opcode(&self) -> u16 {
        (self.flags & OPCODE_MASK) >> 11
    }

    pub fn from_wire(buf: &[u8]) -> Result<Message, DnsError> {
        let mut r = Reader { buf, pos: 0 };
        let id = r.u16()?;
        let flags = r.u16()?;
        let qdcount = r.u16()?;
        let ancount = r.u16()?;
        let nscount = r.u16()?;
        let arcount = r.u16()?;

        let mut question = Vec::new();
        for _ in 0..qdcount {
            let name = r.name()?;
            let qtype = r.u16()?;
            let class = r.u16()?;
            question.push(Question { name, qtype, class });
        }
        let mut sections = [Vec::new(), Vec::new(), Vec::new()];
        for (section, count) in sections.iter_mut().zip([ancount, nscount, arcount]) {
            for _ in 0..count {
                let name = r.name()?;
                let rtype = r.u16()?;
                let class = r.u16()?;
                let ttl = r.u32()?;
                let rdlength = r.u16()? as usize;
                let data = r.take(rdlength)?.to_vec();
                section.push(ResourceRecord {
                    name,
                    rtype,
                    class,
                    ttl,
                    data,
                });
            }
        }
        let [answer, authority, additional] = sections;
        if r.pos != buf.len() {
            return Err(DnsError::TrailingBytes);
        }
        Ok(Message {
            id,
            flags,
            question,
            answer,
            authority,
            additional,
        })
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, DnsError> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        for count in [
            self.question.len(),
            self.answer.len(),
            self.authority.len(),
            self.additional.len(),
        ] {
            let count = u16::try_from(count).map_err(|_| DnsError::TooManyRecords)?;
            buf.extend_from_slice(&count.to_be_bytes());
        }

        // Offset of the first question name, for pointer compression of any
        // record that shares it.
        let mut question_name_at: Option<(usize, &Name)> = None;
        for q in &self.question {
            q.name.check()?;
            if question_name_at.is_none() {
                question_name_at = Some((buf.len(), &q.name));
            }
            write_name(&mut buf, &q.name);
            buf.extend_from_slice(&q.qtype.to_be_bytes());
            buf.extend_from_slice(&q.class.to_be_bytes());
        }
        for rr in self
            .answer
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            match question_name_at {
                Some((offset, qname))
                    if Name::eq_ignore_case(rr.name.labels(), qname.labels()) =>
                {
                    let pointer = 0xc000u16 | offset as u16;
                    buf.extend_from_slice(&pointer.to_be_bytes());
                }
                _ => {
                    rr.name.check()?;
                    write_name(&mut buf, &rr.name);
                }
            }
            buf.extend_from_slice(&rr.rtype.to_be_bytes());
            buf.extend_from_slice(&rr.class.to_be_bytes());
            buf.extend_from_slice(&rr.ttl.to_be_bytes());
            let rdlength = u16::try_from(rr.data.len()).map_err(|_| DnsError::RdataTooLong)?;
            buf.extend_from_slice(&rdlength.to_be_bytes());
            buf.extend_from_slice(&rr.data);
        }
        Ok(buf)
    }
}

fn write_name(buf: &mut Vec<u8>, name: &Name) {
    for label in name.labels() {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label);
    }
    buf.push(0);
}

/// Encodes a byte string as TXT RDATA: a sequence of length-prefixed
/// character-strings of at most 255 bytes each. Empty input yields a single
/// empty character-string, since TXT RDATA must contain at least one.
pub fn encode_rdata_txt(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return vec![0];
    }
    let mut out = Vec::with_capacity(data.len() + data.len() / 255 + 1);
    for chunk in data.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Concatenates the character-strings of TXT RDATA back into one byte string.
pub fn decode_rdata_txt(rdata: &[u8]) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::with_capacity(rdata.len());
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        if pos + len > rdata.len() {
            return Err(DnsError::Truncated);
        }
        out.extend_from_slice(&rdata[pos..pos + len]);
        pos += len;
    }
    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DnsError> {
        let b = *self.buf.get(self.pos).ok_or(DnsError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let hi = self.u16()?;
        let lo = self.u16()?;
        Ok((u32::from(hi) << 16) | u32::from(lo))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DnsError> {
        if self.pos + n > self.buf.len() {
            return Err(DnsError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Reads a possibly-compressed name starting at the current position.
    fn name(&mut self) -> Result<Name, DnsError> {
        let mut labels = Vec::new();
        let mut wire_len = 1usize;
        // Position to resume from once the first pointer has been followed.
        let mut resume: Option<usize> = None;
        let mut at = self.pos;
        loop {
            let len = *self.buf.get(at).ok_or(DnsError::Truncated)? as usize;
            if len & 0xc0 == 0xc0 {
                let lo = *self.buf.get(at + 1).ok_or(DnsError::Truncated)? as usize;
                let target = (len & 0x3f) << 8 | lo;
                // Pointers must point backwards; that bounds the walk.
                if target >= at {
                    return Err(DnsError::BadPointer);
                }
                if resume.is_none() {
                    resume = Some(at + 2);
                }
                at = target;
                continue;
            }
            if len & 0xc0 != 0 {
                return Err(DnsError::BadPointer);
            }
            if len == 0 {
                at += 1;
                break;
            }
            if at + 1 + len > self.buf.len() {
                return Err(DnsError::Truncated);
            }
            wire_len += len + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(DnsError::NameTooLong);
            }
            labels.push(self.buf[at + 1..at + 1 + len].to_vec());
            at += 1 + len;
        }
        self.pos = resume.unwrap_or(at);
        Ok(Name(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[test]
    fn name_parse_and_display() {
        let n = name("t.example.com");
        assert_eq!(n.labels().len(), 3);
        assert_eq!(n.to_string(), "t.example.com");
        assert_eq!(name("t.example.com.").labels().len(), 3);
        assert_eq!(Name::parse(".").unwrap(), Name::root());
        assert!(Name::parse("a..b").is_err());
        let long = "a".repeat(64);
        assert!(Name::parse(&long).is_err());
    }

    #[test]
    fn name_length_limit() {
        // 4 * (63 + 1) + 1 = 257 > 255.
        let long = format!("{0}.{0}.{0}.{0}", "a".repeat(63));
        assert!(Name::parse(&long).is_err());
        let ok = format!("{0}.{0}.{0}.{1}", "a".repeat(63), "a".repeat(61));
        assert!(Name::parse(&ok).is_ok());
    }

    #[test]
    fn trim_suffix_case_insensitive() {
        let n = name("AAA.bbb.T.Example.COM");
        let suffix = name("t.example.com");
        let prefix = n.trim_suffix(&suffix).unwrap();
        assert_eq!(prefix, name("AAA.bbb"));
        assert!(n.trim_suffix(&name("other.com")).is_none());
        assert!(name("com").trim_suffix(&suffix).is_none());
    }

    #[test]
    fn message_round_trip() {
        let msg = Message {
            id: 0x1234,
            flags: 0x0100,
            question: vec![Question {
                name: name("abc.t.example.com"),
                qtype: RR_TYPE_TXT,
                class: CLASS_IN,
            }],
            additional: vec![ResourceRecord {
                name: Name::root(),
                rtype: RR_TYPE_OPT,
                class: 4096,
                ttl: 0,
                data: Vec::new(),
            }],
            ..Default::default()
        };
        let wire = msg.to_wire().unwrap();
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.id, 0x1234);
        assert_eq!(back.flags, 0x0100);
        assert_eq!(back.question, msg.question);
        assert_eq!(back.additional, msg.additional);
    }

    #[test]
    fn answer_name_is_compressed() {
        let q = name("abc.t.example.com");
        let msg = Message {
            id: 1,
            flags: FLAG_QR,
            question: vec![Question {
                name: q.clone(),
                qtype: RR_TYPE_TXT,
                class: CLASS_IN,
            }],
            answer: vec![ResourceRecord {
                name: q.clone(),
                rtype: RR_TYPE_TXT,
                class: CLASS_IN,
                ttl: 60,
                data: encode_rdata_txt(b"hello"),
            }],
            ..Default::default()
        };
        let wire = msg.to_wire().unwrap();
        // The answer name must be a two-byte pointer to offset 12.
        let qlen = q.wire_len() + 4;
        assert_eq!(&wire[12 + qlen..12 + qlen + 2], &[0xc0, 0x0c]);
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.answer[0].name, q);
        assert_eq!(decode_rdata_txt(&back.answer[0].data).unwrap(), b"hello");
    }

    #[test]
    fn forward_pointer_rejected() {
        // Header plus a question name that points at itself.
        let mut buf = vec![0u8; 12];
        buf[5] = 1; // QDCOUNT = 1
        buf.extend_from_slice(&[0xc0, 12, 0, 16, 0, 1]);
        assert!(matches!(
            Message::from_wire(&buf),
            Err(DnsError::BadPointer)
        ));
    }

    #[test]
    fn txt_rdata_chunking() {
        assert_eq!(encode_rdata_txt(b""), vec![0]);
        let data = vec![0x42u8; 300];
        let rdata = encode_rdata_txt(&data);
        assert_eq!(rdata.len(), 300 + 2);
        assert_eq!(rdata[0], 255);
        assert_eq!(rdata[256], 45);
        assert_eq!(decode_rdata_txt(&rdata).unwrap(), data);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let msg = Message {
            id: 7,
            ..Default::default()
        };
        let mut wire = msg.to_wire().unwrap();
        wire.push(0);
        assert!(matches!(
            Message::from_wire(&wire),
            Err(DnsError::TrailingBytes)
        ));
    }
}
