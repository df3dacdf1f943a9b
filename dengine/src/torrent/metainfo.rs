use bencoder::bencode::{Bencode, BencodeError};

use crate::adapters::hasher::Hasher;
use crate::common::info_hash::InfoHash;

use super::info::{FromInfoError, Info};

/// A parsed `.torrent` file: announce tiers, the info dict, and the raw
/// info-dict bytes the infohash was computed over.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaInfo {
    pub announce_tiers: Vec<Vec<String>>,
    pub info: Info,
    pub info_bytes: Vec<u8>,
    pub info_hash: InfoHash,
}

/// Possible `MetaInfo` parsing errors.
#[derive(Debug, PartialEq)]
pub enum FromMetaInfoError {
    MalformedBencode(BencodeError),
    NotADict,
    MissingInfo,
    FromInfoError(FromInfoError),
}

impl MetaInfo {
    /// Parses the raw bytes of a `.torrent` file.
    ///
    /// The infohash is the SHA-1 of the info dict exactly as it appeared in
    /// the buffer, not of a re-encoding.
    ///
    /// It returns a `FromMetaInfoError` if:
    /// - The buffer is not valid bencode or not a dict.
    /// - There is no `info` key.
    /// - The info dict itself is malformed.
    pub fn from_bytes(data: &[u8], hasher: &dyn Hasher) -> Result<MetaInfo, FromMetaInfoError> {
        let bencode = Bencode::decode(data).map_err(FromMetaInfoError::MalformedBencode)?;
        let dict = bencode.as_dict().ok_or(FromMetaInfoError::NotADict)?;

        let info_bytes = Self::raw_info_span(data)?.to_vec();
        let info_hash = InfoHash::new(hasher.sha1(&info_bytes));

        let info_bencode = dict.get(b"info".as_ref()).ok_or(FromMetaInfoError::MissingInfo)?;
        let info = Info::from(info_bencode).map_err(FromMetaInfoError::FromInfoError)?;

        let announce_tiers = Self::create_announce_tiers(&bencode);

        Ok(MetaInfo {
            announce_tiers,
            info,
            info_bytes,
            info_hash,
        })
    }

    /// Builds a `MetaInfo` from a bare info dict received over ut_metadata.
    pub fn from_info_bytes(
        info_bytes: &[u8],
        trackers: Vec<String>,
        hasher: &dyn Hasher,
    ) -> Result<MetaInfo, FromMetaInfoError> {
        let bencode =
            Bencode::decode(info_bytes).map_err(FromMetaInfoError::MalformedBencode)?;
        let info = Info::from(&bencode).map_err(FromMetaInfoError::FromInfoError)?;
        let info_hash = InfoHash::new(hasher.sha1(info_bytes));
        let announce_tiers = if trackers.is_empty() {
            Vec::new()
        } else {
            vec![trackers]
        };
        Ok(MetaInfo {
            announce_tiers,
            info,
            info_bytes: info_bytes.to_vec(),
            info_hash,
        })
    }

    /// All tracker URLs, tier order preserved.
    pub fn all_trackers(&self) -> Vec<String> {
        self.announce_tiers.iter().flatten().cloned().collect()
    }

    // Walks the top-level dict entry by entry to find the exact byte range of
    // the `info` value.
    fn raw_info_span(data: &[u8]) -> Result<&[u8], FromMetaInfoError> {
        if data.first() != Some(&b'd') {
            return Err(FromMetaInfoError::NotADict);
        }
        let mut offset = 1;
        while offset < data.len() && data[offset] != b'e' {
            let (key, key_len) = Bencode::decode_prefix(&data[offset..])
                .map_err(FromMetaInfoError::MalformedBencode)?;
            offset += key_len;
            let (_, value_len) = Bencode::decode_prefix(&data[offset..])
                .map_err(FromMetaInfoError::MalformedBencode)?;
            if key.as_bytes() == Some(b"info".as_ref()) {
                return Ok(&data[offset..offset + value_len]);
            }
            offset += value_len;
        }
        Err(FromMetaInfoError::MissingInfo)
    }

    fn create_announce_tiers(bencode: &Bencode) -> Vec<Vec<String>> {
        let mut tiers: Vec<Vec<String>> = Vec::new();

        if let Some(list) = bencode.dict_get(b"announce-list").and_then(|v| v.as_list()) {
            for tier in list {
                let urls: Vec<String> = tier
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|u| u.as_bytes())
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .collect();
                if !urls.is_empty() {
                    tiers.push(urls);
                }
            }
        }

        // the flat announce key becomes a final fallback tier
        if let Some(announce) = bencode.dict_get(b"announce").and_then(|v| v.as_bytes()) {
            let url = String::from_utf8_lossy(announce).to_string();
            if !tiers.iter().flatten().any(|u| *u == url) {
                tiers.push(vec![url]);
            }
        }

        tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hasher::Sha1Hasher;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_bytes_full() {
        let data = build_torrent_bytes();
        let meta = MetaInfo::from_bytes(&data, &Sha1Hasher).unwrap();

        assert_eq!(meta.info.name, "example");
        assert_eq!(meta.info.piece_length, 16384);
        assert_eq!(
            meta.announce_tiers,
            vec![vec!["http://example.com/announce".to_string()]]
        );
    }

    #[test]
    fn test_info_hash_covers_exact_span() {
        let data = build_torrent_bytes();
        let meta = MetaInfo::from_bytes(&data, &Sha1Hasher).unwrap();

        let expected = Sha1Hasher.sha1(&meta.info_bytes);
        assert_eq!(meta.info_hash.as_bytes(), &expected);
        // the span round-trips through the codec as the same dict
        let reparsed = Bencode::decode(&meta.info_bytes).unwrap();
        assert!(reparsed.dict_get(b"pieces").is_some());
    }

    #[test]
    fn test_announce_list_tiers_with_fallback() {
        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://fallback/announce".to_vec()),
        );
        top.insert(
            b"announce-list".to_vec(),
            Bencode::BList(vec![
                Bencode::BList(vec![
                    Bencode::BString(b"http://a/announce".to_vec()),
                    Bencode::BString(b"http://b/announce".to_vec()),
                ]),
                Bencode::BList(vec![Bencode::BString(b"udp://c:6969".to_vec())]),
            ]),
        );
        top.insert(b"info".to_vec(), build_info_bencode());
        let data = Bencode::encode(&Bencode::BDict(top));

        let meta = MetaInfo::from_bytes(&data, &Sha1Hasher).unwrap();

        assert_eq!(meta.announce_tiers.len(), 3);
        assert_eq!(meta.announce_tiers[0].len(), 2);
        assert_eq!(meta.announce_tiers[2], vec!["http://fallback/announce"]);
        assert_eq!(meta.all_trackers().len(), 4);
    }

    #[test]
    fn test_missing_info() {
        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://a/announce".to_vec()),
        );
        let data = Bencode::encode(&Bencode::BDict(top));

        assert_eq!(
            MetaInfo::from_bytes(&data, &Sha1Hasher).unwrap_err(),
            FromMetaInfoError::MissingInfo
        );
    }

    #[test]
    fn test_malformed_bencode() {
        assert!(matches!(
            MetaInfo::from_bytes(b"not bencode", &Sha1Hasher).unwrap_err(),
            FromMetaInfoError::MalformedBencode(_)
        ));
    }

    #[test]
    fn test_not_a_dict() {
        assert_eq!(
            MetaInfo::from_bytes(b"i7e", &Sha1Hasher).unwrap_err(),
            FromMetaInfoError::NotADict
        );
    }

    #[test]
    fn test_from_info_bytes_matches_from_bytes() {
        let data = build_torrent_bytes();
        let full = MetaInfo::from_bytes(&data, &Sha1Hasher).unwrap();

        let bare = MetaInfo::from_info_bytes(
            &full.info_bytes,
            vec!["http://example.com/announce".to_string()],
            &Sha1Hasher,
        )
        .unwrap();

        assert_eq!(bare.info_hash, full.info_hash);
        assert_eq!(bare.info, full.info);
    }

    // Auxiliary functions

    fn build_info_bencode() -> Bencode {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(16384));
        info.insert(b"name".to_vec(), Bencode::BString(b"example".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(16384));
        info.insert(b"pieces".to_vec(), Bencode::BString(vec![0xab; 20]));
        Bencode::BDict(info)
    }

    fn build_torrent_bytes() -> Vec<u8> {
        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://example.com/announce".to_vec()),
        );
        top.insert(b"info".to_vec(), build_info_bencode());
        Bencode::encode(&Bencode::BDict(top))
    }
}
