use std::collections::BTreeMap;

use bencoder::bencode::{Bencode, BencodeError};

/// Extension ID we assign to ut_metadata in our `m` map.
pub const LOCAL_UT_METADATA_ID: u8 = 1;
/// Extension ID we assign to ut_pex in our `m` map.
pub const LOCAL_UT_PEX_ID: u8 = 2;

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";

/// The BEP-10 extended handshake dict.
///
/// Only keys this engine understands are lifted into fields; everything else
/// is kept opaquely so a re-encode round-trips it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionHandshake {
    /// Extension name to the sender's message ID for it.
    pub m: BTreeMap<String, u8>,
    pub v: Option<String>,
    pub p: Option<u16>,
    pub yourip: Option<Vec<u8>>,
    pub reqq: Option<i64>,
    pub metadata_size: Option<i64>,
    unknown: BTreeMap<Vec<u8>, Bencode>,
}

#[derive(Debug, PartialEq)]
pub enum ExtensionHandshakeError {
    MalformedBencode(BencodeError),
    NotADict,
}

impl ExtensionHandshake {
    /// The handshake this engine sends: our extension IDs, client tag and
    /// listen port, plus `metadata_size` once we can serve the info dict.
    pub fn local(listen_port: u16, metadata_size: Option<i64>) -> ExtensionHandshake {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        m.insert(UT_PEX.to_string(), LOCAL_UT_PEX_ID);
        ExtensionHandshake {
            m,
            v: Some("dengine 0.1".to_string()),
            p: Some(listen_port),
            yourip: None,
            reqq: Some(500),
            metadata_size,
            unknown: BTreeMap::new(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<ExtensionHandshake, ExtensionHandshakeError> {
        let bencode =
            Bencode::decode(payload).map_err(ExtensionHandshakeError::MalformedBencode)?;
        let dict = bencode.as_dict().ok_or(ExtensionHandshakeError::NotADict)?;

        let mut handshake = ExtensionHandshake::default();
        for (key, value) in dict {
            match key.as_slice() {
                b"m" => {
                    if let Some(m) = value.as_dict() {
                        for (name, id) in m {
                            if let Some(id) = id.as_number() {
                                handshake.m.insert(
                                    String::from_utf8_lossy(name).to_string(),
                                    id as u8,
                                );
                            }
                        }
                    }
                }
                b"v" => {
                    handshake.v = value
                        .as_bytes()
                        .map(|b| String::from_utf8_lossy(b).to_string())
                }
                b"p" => handshake.p = value.as_number().map(|n| n as u16),
                b"yourip" => handshake.yourip = value.as_bytes().map(|b| b.to_vec()),
                b"reqq" => handshake.reqq = value.as_number(),
                b"metadata_size" => handshake.metadata_size = value.as_number(),
                _ => {
                    handshake.unknown.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(handshake)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Bencode> = self.unknown.clone();

        let mut m = BTreeMap::new();
        for (name, id) in &self.m {
            m.insert(name.as_bytes().to_vec(), Bencode::BNumber(*id as i64));
        }
        dict.insert(b"m".to_vec(), Bencode::BDict(m));

        if let Some(v) = &self.v {
            dict.insert(b"v".to_vec(), Bencode::BString(v.as_bytes().to_vec()));
        }
        if let Some(p) = self.p {
            dict.insert(b"p".to_vec(), Bencode::BNumber(p as i64));
        }
        if let Some(yourip) = &self.yourip {
            dict.insert(b"yourip".to_vec(), Bencode::BString(yourip.clone()));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(b"reqq".to_vec(), Bencode::BNumber(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Bencode::BNumber(size));
        }

        Bencode::encode(&Bencode::BDict(dict))
    }

    /// The remote's message ID for one of our known extensions, if offered.
    pub fn remote_id(&self, extension: &str) -> Option<u8> {
        self.m.get(extension).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_handshake_roundtrip() {
        let local = ExtensionHandshake::local(6881, Some(4321));
        let decoded = ExtensionHandshake::decode(&local.encode()).unwrap();

        assert_eq!(decoded.remote_id(UT_METADATA), Some(LOCAL_UT_METADATA_ID));
        assert_eq!(decoded.remote_id(UT_PEX), Some(LOCAL_UT_PEX_ID));
        assert_eq!(decoded.p, Some(6881));
        assert_eq!(decoded.metadata_size, Some(4321));
        assert_eq!(decoded.reqq, Some(500));
    }

    #[test]
    fn test_decode_foreign_ids() {
        let payload = b"d1:md11:ut_metadatai3e6:ut_pexi7eee";
        let handshake = ExtensionHandshake::decode(payload).unwrap();

        assert_eq!(handshake.remote_id(UT_METADATA), Some(3));
        assert_eq!(handshake.remote_id(UT_PEX), Some(7));
        assert_eq!(handshake.remote_id("ut_holepunch"), None);
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let payload = b"d12:complete_agoi42e1:mdee";
        let handshake = ExtensionHandshake::decode(payload).unwrap();

        let reencoded = handshake.encode();
        let again = ExtensionHandshake::decode(&reencoded).unwrap();
        assert_eq!(again, handshake);
        // the opaque key survived the round trip
        assert!(String::from_utf8_lossy(&reencoded).contains("complete_ago"));
    }

    #[test]
    fn test_decode_rejects_non_dict() {
        assert_eq!(
            ExtensionHandshake::decode(b"i1e").unwrap_err(),
            ExtensionHandshakeError::NotADict
        );
        assert!(matches!(
            ExtensionHandshake::decode(b"garbage").unwrap_err(),
            ExtensionHandshakeError::MalformedBencode(_)
        ));
    }
}
