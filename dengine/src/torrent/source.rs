use crate::common::magnet::{Magnet, MagnetError};

/// What a torrent was created from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Raw bytes of a `.torrent` file.
    TorrentFile(Vec<u8>),
    Magnet(Magnet),
}

impl TorrentSource {
    /// Interprets a string as a magnet URI.
    pub fn from_magnet_uri(uri: &str) -> Result<TorrentSource, MagnetError> {
        Ok(TorrentSource::Magnet(Magnet::parse(uri)?))
    }
}
