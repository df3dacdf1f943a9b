use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bencoder::bencode::Bencode;

use crate::adapters::filesystem::FileSystem;
use crate::common::bitfield::Bitfield;
use crate::common::info_hash::InfoHash;

/// Sidecar store for completed boundary pieces whose skipped-file portion is
/// not written to the content files.
///
/// On disk it is `<infohash>.parts`, a bencoded `{piece_index -> bytes}`
/// dict. Any parse failure on load starts from empty.
pub struct PartsFile {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    pieces: BTreeMap<u32, Vec<u8>>,
}

impl PartsFile {
    /// Opens (or starts empty) the parts file for a torrent.
    pub fn load(root: &PathBuf, info_hash: &InfoHash, fs: Arc<dyn FileSystem>) -> PartsFile {
        let path = root.join(format!("{}.parts", info_hash.to_hex()));
        let pieces = match fs.read_file(&path) {
            Ok(bytes) => Self::parse(&bytes).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        PartsFile { path, fs, pieces }
    }

    fn parse(bytes: &[u8]) -> Option<BTreeMap<u32, Vec<u8>>> {
        let bencode = Bencode::decode(bytes).ok()?;
        let dict = bencode.as_dict()?;
        let mut pieces = BTreeMap::new();
        for (key, value) in dict {
            let index: u32 = String::from_utf8_lossy(key).parse().ok()?;
            pieces.insert(index, value.as_bytes()?.to_vec());
        }
        Some(pieces)
    }

    /// Stores a piece's bytes and persists the file.
    pub fn insert(&mut self, piece_index: u32, bytes: Vec<u8>) -> io::Result<()> {
        self.pieces.insert(piece_index, bytes);
        self.persist()
    }

    /// Removes a piece (it became servable from content files) and persists.
    pub fn remove(&mut self, piece_index: u32) -> io::Result<()> {
        if self.pieces.remove(&piece_index).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn contains(&self, piece_index: u32) -> bool {
        self.pieces.contains_key(&piece_index)
    }

    pub fn get(&self, piece_index: u32) -> Option<&[u8]> {
        self.pieces.get(&piece_index).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Bitfield of the pieces held here, for masking the advertised bitfield.
    pub fn piece_mask(&self, piece_count: usize) -> Bitfield {
        let mut mask = Bitfield::new(piece_count);
        for index in self.pieces.keys() {
            mask.set(*index as usize, true);
        }
        mask
    }

    fn persist(&self) -> io::Result<()> {
        let mut dict = BTreeMap::new();
        for (index, bytes) in &self.pieces {
            dict.insert(
                index.to_string().into_bytes(),
                Bencode::BString(bytes.clone()),
            );
        }
        self.fs.write_file(&self.path, &Bencode::encode(&Bencode::BDict(dict)))
    }
}
