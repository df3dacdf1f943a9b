use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bencoder::bencode::{Bencode, BencodeError};

/// ut_metadata chunk size (BEP-9).
pub const METADATA_CHUNK_SIZE: usize = 16384;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// A ut_metadata wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: i64, payload: Vec<u8> },
    Reject { piece: u32 },
}

#[derive(Debug, PartialEq)]
pub enum MetadataMessageError {
    MalformedBencode(BencodeError),
    MissingField,
    UnknownType(i64),
}

impl MetadataMessage {
    /// Decodes the bencoded header and, for data messages, the raw chunk
    /// appended after it.
    pub fn decode(payload: &[u8]) -> Result<MetadataMessage, MetadataMessageError> {
        let (header, consumed) = Bencode::decode_prefix(payload)
            .map_err(MetadataMessageError::MalformedBencode)?;
        let msg_type = header
            .dict_get(b"msg_type")
            .and_then(|v| v.as_number())
            .ok_or(MetadataMessageError::MissingField)?;
        let piece = header
            .dict_get(b"piece")
            .and_then(|v| v.as_number())
            .ok_or(MetadataMessageError::MissingField)? as u32;

        match msg_type {
            MSG_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_DATA => {
                let total_size = header
                    .dict_get(b"total_size")
                    .and_then(|v| v.as_number())
                    .ok_or(MetadataMessageError::MissingField)?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    payload: payload[consumed..].to_vec(),
                })
            }
            MSG_REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(MetadataMessageError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            MetadataMessage::Request { piece } => {
                dict.insert(b"msg_type".to_vec(), Bencode::BNumber(MSG_REQUEST));
                dict.insert(b"piece".to_vec(), Bencode::BNumber(*piece as i64));
                Bencode::encode(&Bencode::BDict(dict))
            }
            MetadataMessage::Data {
                piece,
                total_size,
                payload,
            } => {
                dict.insert(b"msg_type".to_vec(), Bencode::BNumber(MSG_DATA));
                dict.insert(b"piece".to_vec(), Bencode::BNumber(*piece as i64));
                dict.insert(b"total_size".to_vec(), Bencode::BNumber(*total_size));
                let mut bytes = Bencode::encode(&Bencode::BDict(dict));
                bytes.extend(payload);
                bytes
            }
            MetadataMessage::Reject { piece } => {
                dict.insert(b"msg_type".to_vec(), Bencode::BNumber(MSG_REJECT));
                dict.insert(b"piece".to_vec(), Bencode::BNumber(*piece as i64));
                Bencode::encode(&Bencode::BDict(dict))
            }
        }
    }
}

/// Assembles the info dict from ut_metadata chunks, with exponential backoff
/// between failed attempts.
#[derive(Debug)]
pub struct MetadataExchange {
    total_size: usize,
    chunks: Vec<Option<Vec<u8>>>,
    attempts: u32,
    retry_after: Option<Instant>,
}

impl MetadataExchange {
    pub fn new(total_size: usize) -> MetadataExchange {
        let chunk_count = (total_size + METADATA_CHUNK_SIZE - 1) / METADATA_CHUNK_SIZE;
        MetadataExchange {
            total_size,
            chunks: vec![None; chunk_count.max(1)],
            attempts: 0,
            retry_after: None,
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Chunk indices still missing, in order.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Stores a received chunk. Returns whether every chunk is present.
    pub fn store(&mut self, piece: u32, payload: Vec<u8>) -> bool {
        if let Some(slot) = self.chunks.get_mut(piece as usize) {
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.is_some())
    }

    /// Concatenates the chunks, truncated to the advertised size.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size);
        for chunk in self.chunks.iter().flatten() {
            out.extend(chunk);
        }
        out.truncate(self.total_size);
        out
    }

    /// The assembled bytes did not hash to the infohash: drop everything and
    /// back off exponentially before the next attempt.
    pub fn restart_after_mismatch(&mut self, now: Instant) {
        for chunk in self.chunks.iter_mut() {
            *chunk = None;
        }
        self.attempts += 1;
        let backoff = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempts.min(6))
            .min(BACKOFF_CAP);
        self.retry_after = Some(now + backoff);
    }

    /// Whether requesting is currently allowed (backoff elapsed).
    pub fn may_request(&self, now: Instant) -> bool {
        match self.retry_after {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
