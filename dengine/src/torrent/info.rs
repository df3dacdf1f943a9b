use std::collections::BTreeMap;

use bencoder::bencode::{Bencode, ToBencode};

/// Maximum accepted piece length. Anything bigger is a construction error.
pub const MAX_PIECE_LENGTH: u32 = 32 * 1024 * 1024;

const PIECE_HASH_LENGTH: usize = 20;

/// One file of the torrent payload, positioned in the linear piece space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    /// Path components relative to the torrent name directory.
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of the file's first byte in the torrent linear space.
    pub offset: u64,
}

/// The parsed `info` dict: piece geometry, hashes and file layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Info {
    pub name: String,
    pub piece_length: u32,
    /// Concatenation of 20-byte SHA-1 piece hashes.
    pub pieces: Vec<u8>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
}

/// Possible `Info` parsing errors.
#[derive(Debug, PartialEq)]
pub enum FromInfoError {
    MissingName,
    MissingPieceLength,
    MissingPieces,
    MissingLength,
    InvalidFilesList,
    PieceLengthTooLarge,
    PieceCountMismatch,
    NotADict,
}

impl Info {
    /// Parses an `info` dict, accepting both single-file (`length`) and
    /// multi-file (`files`) layouts.
    pub fn from(bencode: &Bencode) -> Result<Info, FromInfoError> {
        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromInfoError::NotADict),
        };

        let name = match d.get(b"name".as_ref()).and_then(|v| v.as_bytes()) {
            Some(bytes) => String::from_utf8_lossy(bytes).to_string(),
            None => return Err(FromInfoError::MissingName),
        };

        let piece_length = match d.get(b"piece length".as_ref()).and_then(|v| v.as_number()) {
            Some(n) if n > 0 => n as u64,
            _ => return Err(FromInfoError::MissingPieceLength),
        };
        if piece_length > MAX_PIECE_LENGTH as u64 {
            return Err(FromInfoError::PieceLengthTooLarge);
        }
        let piece_length = piece_length as u32;

        let pieces = match d.get(b"pieces".as_ref()).and_then(|v| v.as_bytes()) {
            Some(bytes) if bytes.len() % PIECE_HASH_LENGTH == 0 => bytes.to_vec(),
            _ => return Err(FromInfoError::MissingPieces),
        };

        let files = match d.get(b"files".as_ref()) {
            Some(files_bencode) => Self::create_files(files_bencode)?,
            None => {
                let length = match d.get(b"length".as_ref()).and_then(|v| v.as_number()) {
                    Some(n) if n >= 0 => n as u64,
                    _ => return Err(FromInfoError::MissingLength),
                };
                vec![FileEntry {
                    path: vec![name.clone()],
                    length,
                    offset: 0,
                }]
            }
        };

        let total_length = files.iter().map(|f| f.length).sum();

        let info = Info {
            name,
            piece_length,
            pieces,
            files,
            total_length,
        };
        if info.pieces.len() / PIECE_HASH_LENGTH != info.total_pieces() as usize {
            return Err(FromInfoError::PieceCountMismatch);
        }
        Ok(info)
    }

    fn create_files(bencode: &Bencode) -> Result<Vec<FileEntry>, FromInfoError> {
        let list = match bencode.as_list() {
            Some(l) if !l.is_empty() => l,
            _ => return Err(FromInfoError::InvalidFilesList),
        };

        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;
        for entry in list {
            let length = match entry.dict_get(b"length").and_then(|v| v.as_number()) {
                Some(n) if n >= 0 => n as u64,
                _ => return Err(FromInfoError::InvalidFilesList),
            };
            let path_list = entry
                .dict_get(b"path")
                .and_then(|v| v.as_list())
                .ok_or(FromInfoError::InvalidFilesList)?;
            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let bytes = component.as_bytes().ok_or(FromInfoError::InvalidFilesList)?;
                path.push(String::from_utf8_lossy(bytes).to_string());
            }
            if path.is_empty() {
                return Err(FromInfoError::InvalidFilesList);
            }
            files.push(FileEntry {
                path,
                length,
                offset,
            });
            offset += length;
        }
        Ok(files)
    }

    /// Returns the number of pieces of the torrent.
    pub fn total_pieces(&self) -> u32 {
        ((self.total_length + self.piece_length as u64 - 1) / self.piece_length as u64) as u32
    }

    /// Returns the byte length of the given piece (the last one may be short).
    pub fn piece_size(&self, index: u32) -> u32 {
        if index + 1 == self.total_pieces() {
            let remainder = (self.total_length % self.piece_length as u64) as u32;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        } else {
            self.piece_length
        }
    }

    /// Returns the 20-byte hash for the given piece, or `None` out of range.
    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * PIECE_HASH_LENGTH;
        let end = start + PIECE_HASH_LENGTH;
        if end > self.pieces.len() {
            return None;
        }
        Some(&self.pieces[start..end])
    }

    /// Returns whether this is a single-file torrent.
    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].path == vec![self.name.clone()]
    }
}

impl ToBencode for Info {
    fn to_bencode(&self) -> Bencode {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), self.name.to_bencode());
        info.insert(b"piece length".to_vec(), self.piece_length.to_bencode());
        info.insert(b"pieces".to_vec(), self.pieces.to_bencode());
        if self.is_single_file() {
            info.insert(b"length".to_vec(), self.total_length.to_bencode());
        } else {
            let files: Vec<Bencode> = self
                .files
                .iter()
                .map(|f| {
                    let mut entry = BTreeMap::new();
                    entry.insert(b"length".to_vec(), f.length.to_bencode());
                    entry.insert(
                        b"path".to_vec(),
                        Bencode::BList(f.path.iter().map(|c| c.to_bencode()).collect()),
                    );
                    Bencode::BDict(entry)
                })
                .collect();
            info.insert(b"files".to_vec(), Bencode::BList(files));
        }
        Bencode::BDict(info)
    }
}
