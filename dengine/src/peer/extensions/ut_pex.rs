use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bencoder::bencode::{Bencode, BencodeError};

const V4_COMPACT_LENGTH: usize = 6;
const V6_COMPACT_LENGTH: usize = 18;

/// A ut_pex gossip message: endpoints added to and dropped from the
/// sender's connected set since its last message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    /// One flag byte per added peer (`added.f`), zero when unknown.
    pub added_flags: Vec<u8>,
    pub dropped: Vec<SocketAddr>,
}

#[derive(Debug, PartialEq)]
pub enum PexMessageError {
    MalformedBencode(BencodeError),
    NotADict,
}

impl PexMessage {
    pub fn decode(payload: &[u8]) -> Result<PexMessage, PexMessageError> {
        let bencode = Bencode::decode(payload).map_err(PexMessageError::MalformedBencode)?;
        if bencode.as_dict().is_none() {
            return Err(PexMessageError::NotADict);
        }

        let mut message = PexMessage::default();
        if let Some(added) = bencode.dict_get(b"added").and_then(|v| v.as_bytes()) {
            message.added.extend(Self::decode_compact_v4(added));
        }
        if let Some(added6) = bencode.dict_get(b"added6").and_then(|v| v.as_bytes()) {
            message.added.extend(Self::decode_compact_v6(added6));
        }
        if let Some(flags) = bencode.dict_get(b"added.f").and_then(|v| v.as_bytes()) {
            message.added_flags = flags.to_vec();
        }
        if let Some(dropped) = bencode.dict_get(b"dropped").and_then(|v| v.as_bytes()) {
            message.dropped.extend(Self::decode_compact_v4(dropped));
        }
        if let Some(dropped6) = bencode.dict_get(b"dropped6").and_then(|v| v.as_bytes()) {
            message.dropped.extend(Self::decode_compact_v6(dropped6));
        }
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();

        let (added_v4, added_v6) = Self::encode_compact(&self.added);
        dict.insert(b"added".to_vec(), Bencode::BString(added_v4));
        if !added_v6.is_empty() {
            dict.insert(b"added6".to_vec(), Bencode::BString(added_v6));
        }

        let mut flags = self.added_flags.clone();
        flags.resize(self.added.iter().filter(|a| a.is_ipv4()).count(), 0);
        dict.insert(b"added.f".to_vec(), Bencode::BString(flags));

        let (dropped_v4, dropped_v6) = Self::encode_compact(&self.dropped);
        dict.insert(b"dropped".to_vec(), Bencode::BString(dropped_v4));
        if !dropped_v6.is_empty() {
            dict.insert(b"dropped6".to_vec(), Bencode::BString(dropped_v6));
        }

        Bencode::encode(&Bencode::BDict(dict))
    }

    fn encode_compact(addrs: &[SocketAddr]) -> (Vec<u8>, Vec<u8>) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in addrs {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    v4.extend(ip.octets());
                    v4.extend(addr.port().to_be_bytes());
                }
                IpAddr::V6(ip) => {
                    v6.extend(ip.octets());
                    v6.extend(addr.port().to_be_bytes());
                }
            }
        }
        (v4, v6)
    }

    fn decode_compact_v4(bytes: &[u8]) -> Vec<SocketAddr> {
        bytes
            .chunks_exact(V4_COMPACT_LENGTH)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect()
    }

    fn decode_compact_v6(bytes: &[u8]) -> Vec<SocketAddr> {
        bytes
            .chunks_exact(V6_COMPACT_LENGTH)
            .map(|chunk| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&chunk[..16]);
                let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_roundtrip() {
        let message = PexMessage {
            added: vec![addr4("1.2.3.4", 6881), addr4("5.6.7.8", 51413)],
            added_flags: vec![0, 2],
            dropped: vec![addr4("9.9.9.9", 80)],
        };

        let decoded = PexMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_v6_roundtrip() {
        let message = PexMessage {
            added: vec!["[2001:db8::1]:6881".parse().unwrap()],
            added_flags: vec![],
            dropped: vec!["[::1]:1234".parse().unwrap()],
        };

        let decoded = PexMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.added, message.added);
        assert_eq!(decoded.dropped, message.dropped);
    }

    #[test]
    fn test_mixed_families() {
        let message = PexMessage {
            added: vec![addr4("1.2.3.4", 1), "[2001:db8::2]:2".parse().unwrap()],
            added_flags: vec![0],
            dropped: vec![],
        };

        let decoded = PexMessage::decode(&message.encode()).unwrap();
        // v4 entries decode before v6 entries
        assert_eq!(decoded.added.len(), 2);
        assert!(decoded.added.contains(&addr4("1.2.3.4", 1)));
        assert!(decoded
            .added
            .contains(&"[2001:db8::2]:2".parse().unwrap()));
    }

    #[test]
    fn test_decode_ignores_trailing_garbage_bytes() {
        // 7 bytes is not a whole number of compact v4 entries
        let mut dict = BTreeMap::new();
        dict.insert(b"added".to_vec(), Bencode::BString(vec![1, 2, 3, 4, 0, 80, 9]));
        let bytes = Bencode::encode(&Bencode::BDict(dict));

        let decoded = PexMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.added, vec![addr4("1.2.3.4", 80)]);
    }

    #[test]
    fn test_decode_rejects_non_dict() {
        assert_eq!(
            PexMessage::decode(b"le").unwrap_err(),
            PexMessageError::NotADict
        );
    }

    #[test]
    fn test_empty_message() {
        let decoded = PexMessage::decode(&PexMessage::default().encode()).unwrap();
        assert!(decoded.added.is_empty());
        assert!(decoded.dropped.is_empty());
    }

    // Auxiliary functions

    fn addr4(ip: &str, port: u16) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), port)
    }
}
