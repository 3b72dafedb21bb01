//! DNS wire format: A-record queries and address extraction from responses.
//!
//! Only what a stub resolver needs: one question per query, A/AAAA answers,
//! everything else (CNAME chains, authority, additional) skipped by length.

use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Header flag: recursion desired.
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RESPONSE: u16 = 0x8000;
const RESPONSE_CODE_MASK: u16 = 0x000F;
const PTR_MASK: u8 = 0b1100_0000;
const MAX_LABEL: usize = 63;
const MAX_POINTER_JUMPS: usize = 8;

/// Record types the resolver asks for or reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A = 1,
    Aaaa = 28,
}

const CLASS_INTERNET: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,
    #[error("not a response")]
    ResponseExpected,
    #[error("server returned rcode {0}")]
    ResponseCode(u16),
    #[error("invalid label length")]
    InvalidLength,
    #[error("compression pointer loop")]
    PointerLoop,
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl From<std::io::Error> for DnsError {
    fn from(_: std::io::Error) -> Self {
        DnsError::Truncated
    }
}

/// A decoded response: transaction id plus every address answer in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub addresses: Vec<IpAddr>,
}

trait CursorExt {
    fn read_u8(&mut self) -> std::io::Result<u8>;
    fn read_u16(&mut self) -> std::io::Result<u16>;
    fn read_u32(&mut self) -> std::io::Result<u32>;
    fn skip(&mut self, len: usize) -> Result<(), DnsError>;
}

impl CursorExt for Cursor<&[u8]> {
    fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn skip(&mut self, len: usize) -> Result<(), DnsError> {
        let next = self.position() as usize + len;
        if next > self.get_ref().len() {
            return Err(DnsError::Truncated);
        }
        self.set_position(next as u64);
        Ok(())
    }
}

/// Transaction id of a raw message, if it is long enough to carry one.
pub fn message_id(bytes: &[u8]) -> Option<u16> {
    (bytes.len() >= 2).then(|| u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > MAX_LABEL {
            return Err(DnsError::InvalidName(name.to_string()));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Encodes a recursive query for one name.
pub fn build_query(id: u16, name: &str, record_type: RecordType) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::with_capacity(17 + name.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // questions
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // answers, authority, additional
    write_name(&mut out, name)?;
    out.extend_from_slice(&(record_type as u16).to_be_bytes());
    out.extend_from_slice(&CLASS_INTERNET.to_be_bytes());
    Ok(out)
}

/// Encodes a response answering `name` with the given addresses.
///
/// Used by resolver fixtures; answers point back at the question name.
pub fn build_response(id: u16, name: &str, addresses: &[IpAddr]) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(FLAG_RESPONSE | FLAG_RECURSION_DESIRED | 0x0080).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(addresses.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    write_name(&mut out, name)?;
    out.extend_from_slice(&(RecordType::A as u16).to_be_bytes());
    out.extend_from_slice(&CLASS_INTERNET.to_be_bytes());
    for address in addresses {
        out.extend_from_slice(&[0xc0, 12]); // pointer to the question name
        let (record_type, data): (RecordType, Vec<u8>) = match address {
            IpAddr::V4(v4) => (RecordType::A, v4.octets().to_vec()),
            IpAddr::V6(v6) => (RecordType::Aaaa, v6.octets().to_vec()),
        };
        out.extend_from_slice(&(record_type as u16).to_be_bytes());
        out.extend_from_slice(&CLASS_INTERNET.to_be_bytes());
        out.extend_from_slice(&60u32.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(&data);
    }
    Ok(out)
}

// Skips a (possibly compressed) name. Only the bytes inline in this record count.
fn skip_name(cursor: &mut Cursor<&[u8]>) -> Result<(), DnsError> {
    for _ in 0..=MAX_POINTER_JUMPS * 32 {
        let len = cursor.read_u8()?;
        if len & PTR_MASK == PTR_MASK {
            cursor.read_u8()?;
            return Ok(());
        }
        if len == 0 {
            return Ok(());
        }
        if len as usize > MAX_LABEL {
            return Err(DnsError::InvalidLength);
        }
        cursor.skip(len as usize)?;
    }
    Err(DnsError::PointerLoop)
}

/// Decodes a response and collects its A/AAAA answers.
pub fn parse_response(bytes: &[u8]) -> Result<DnsResponse, DnsError> {
    let mut cursor = Cursor::new(bytes);
    let id = cursor.read_u16()?;
    let flags = cursor.read_u16()?;
    let question_count = cursor.read_u16()?;
    let answer_count = cursor.read_u16()?;
    let _nameservers = cursor.read_u16()?;
    let _additional = cursor.read_u16()?;

    if flags & FLAG_RESPONSE == 0 {
        return Err(DnsError::ResponseExpected);
    }
    let rcode = flags & RESPONSE_CODE_MASK;
    if rcode != 0 {
        return Err(DnsError::ResponseCode(rcode));
    }

    for _ in 0..question_count {
        skip_name(&mut cursor)?;
        cursor.skip(4)?;
    }

    let mut addresses = Vec::with_capacity(answer_count as usize);
    for _ in 0..answer_count {
        skip_name(&mut cursor)?;
        let record_type = cursor.read_u16()?;
        let class = cursor.read_u16()?;
        let _ttl = cursor.read_u32()?;
        let len = cursor.read_u16()? as usize;
        match (record_type, class, len) {
            (1, CLASS_INTERNET, 4) => {
                let mut buf = [0; 4];
                cursor.read_exact(&mut buf)?;
                addresses.push(IpAddr::V4(Ipv4Addr::from(buf)));
            }
            (28, CLASS_INTERNET, 16) => {
                let mut buf = [0; 16];
                cursor.read_exact(&mut buf)?;
                addresses.push(IpAddr::V6(Ipv6Addr::from(buf)));
            }
            _ => cursor.skip(len)?,
        }
    }

    Ok(DnsResponse { id, addresses })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let query = build_query(0xbeef, "example.com", RecordType::A).unwrap();
        assert_eq!(&query[..2], &[0xbe, 0xef]);
        assert_eq!(message_id(&query), Some(0xbeef));
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..], &[0, 1, 0, 1]);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(build_query(1, "a..b", RecordType::A).is_err());
        let long = "x".repeat(64);
        assert!(build_query(1, &long, RecordType::A).is_err());
    }

    #[test]
    fn parses_compressed_aaaa_answers() {
        let bytes: [u8; 81] = [
            0xc2, 0x87, 0x81, 0x80, 0x0, 0x1, 0x0, 0x2, 0x0, 0x0, 0x0, 0x0, 0x3, 0x69, 0x62, 0x6d,
            0x3, 0x63, 0x6f, 0x6d, 0x0, 0x0, 0x1c, 0x0, 0x1, 0xc0, 0xc, 0x0, 0x1c, 0x0, 0x1, 0x0,
            0x0, 0x0, 0x8, 0x0, 0x10, 0x26, 0x0, 0x14, 0x6, 0x5e, 0x0, 0x2, 0x93, 0x0, 0x0, 0x0,
            0x0, 0x0, 0x0, 0x38, 0x31, 0xc0, 0xc, 0x0, 0x1c, 0x0, 0x1, 0x0, 0x0, 0x0, 0x8, 0x0,
            0x10, 0x26, 0x0, 0x14, 0x6, 0x5e, 0x0, 0x2, 0xaa, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x38,
            0x31,
        ];
        let response = parse_response(&bytes).unwrap();
        assert_eq!(response.id, 0xc287);
        assert_eq!(
            response.addresses,
            vec![
                "2600:1406:5e00:293::3831".parse::<IpAddr>().unwrap(),
                "2600:1406:5e00:2aa::3831".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn skips_cname_records() {
        let mut bytes = vec![
            0x00, 0x07, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0, 1, b'a', 0, 0, 1, 0, 1,
        ];
        // CNAME answer with 3 bytes of rdata
        bytes.extend_from_slice(&[0xc0, 12, 0, 5, 0, 1, 0, 0, 0, 1, 0, 3, 1, b'b', 0]);
        // A answer
        bytes.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 1, 0, 4, 10, 0, 0, 1]);
        let response = parse_response(&bytes).unwrap();
        assert_eq!(response.addresses, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn builds_parseable_responses() {
        let addrs: Vec<IpAddr> = vec!["1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap()];
        let bytes = build_response(42, "host.test", &addrs).unwrap();
        let response = parse_response(&bytes).unwrap();
        assert_eq!(response.id, 42);
        assert_eq!(response.addresses, addrs);
    }

    #[test]
    fn errors_on_failure_codes_and_truncation() {
        let mut bytes = build_response(1, "a.b", &[]).unwrap();
        bytes[3] |= 0x03;
        assert!(matches!(parse_response(&bytes), Err(DnsError::ResponseCode(3))));
        assert!(matches!(parse_response(&[0, 1, 0x81]), Err(DnsError::Truncated)));
        let query = build_query(1, "a.b", RecordType::A).unwrap();
        assert!(matches!(parse_response(&query), Err(DnsError::ResponseExpected)));
    }
}
