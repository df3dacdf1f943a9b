use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::filesystem::FileSystem;
use crate::torrent::info::Info;

/// One content file with its resolved on-disk path.
#[derive(Debug, Clone)]
struct StoredFile {
    path: PathBuf,
    length: u64,
    offset: u64,
}

/// Maps piece/offset/length ranges onto the torrent's files and performs the
/// reads and writes through the host filesystem.
pub struct ContentStorage {
    files: Vec<StoredFile>,
    piece_length: u32,
    total_length: u64,
    fs: Arc<dyn FileSystem>,
}

/// Possible content storage errors.
#[derive(Debug)]
pub enum ContentStorageError {
    OutOfRange,
    Io(io::Error),
}

impl ContentStorage {
    /// Builds the piece-to-file index for a torrent rooted at
    /// `root/<torrent name>`.
    pub fn new(root: &PathBuf, info: &Info, fs: Arc<dyn FileSystem>) -> ContentStorage {
        let files = info
            .files
            .iter()
            .map(|f| {
                let mut path = root.clone();
                if !info.is_single_file() {
                    path.push(&info.name);
                }
                for component in &f.path {
                    path.push(component);
                }
                StoredFile {
                    path,
                    length: f.length,
                    offset: f.offset,
                }
            })
            .collect();

        ContentStorage {
            files,
            piece_length: info.piece_length,
            total_length: info.total_length,
            fs,
        }
    }

    /// Writes a block of a piece, splitting it across file boundaries.
    pub fn write(
        &self,
        piece_index: u32,
        begin: u32,
        bytes: &[u8],
    ) -> Result<(), ContentStorageError> {
        let ranges = self.file_ranges(piece_index, begin, bytes.len())?;
        let mut consumed = 0;
        for (file_index, offset_in_file, length) in ranges {
            let file = &self.files[file_index];
            self.fs
                .write_at(&file.path, &bytes[consumed..consumed + length], offset_in_file)
                .map_err(ContentStorageError::Io)?;
            consumed += length;
        }
        Ok(())
    }

    /// Reads a block of a piece. Regions never written come back zeroed.
    pub fn read(
        &self,
        piece_index: u32,
        begin: u32,
        length: usize,
    ) -> Result<Vec<u8>, ContentStorageError> {
        let ranges = self.file_ranges(piece_index, begin, length)?;
        let mut out = Vec::with_capacity(length);
        for (file_index, offset_in_file, range_length) in ranges {
            let file = &self.files[file_index];
            let chunk = match self.fs.read_at(&file.path, offset_in_file, range_length) {
                Ok(chunk) => chunk,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(ContentStorageError::Io(err)),
            };
            let got = chunk.len();
            out.extend(chunk);
            // short read inside a sparse file: pad with zeros
            out.resize(out.len() + range_length - got, 0);
        }
        Ok(out)
    }

    /// Total number of pieces covered by this storage.
    pub fn total_pieces(&self) -> u32 {
        ((self.total_length + self.piece_length as u64 - 1) / self.piece_length as u64) as u32
    }

    // Translates (piece, begin, length) into (file index, file offset, length)
    // triples covering the span in file order.
    fn file_ranges(
        &self,
        piece_index: u32,
        begin: u32,
        length: usize,
    ) -> Result<Vec<(usize, u64, usize)>, ContentStorageError> {
        let start = piece_index as u64 * self.piece_length as u64 + begin as u64;
        let end = start + length as u64;
        if end > self.total_length {
            return Err(ContentStorageError::OutOfRange);
        }

        let mut ranges = Vec::new();
        let mut cursor = start;
        for (index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if cursor >= file_end || file.length == 0 {
                continue;
            }
            if cursor < file.offset {
                break;
            }
            let take = ((end - cursor) as usize).min((file_end - cursor) as usize);
            ranges.push((index, cursor - file.offset, take));
            cursor += take as u64;
            if cursor == end {
                break;
            }
        }
        Ok(ranges)
    }
}
