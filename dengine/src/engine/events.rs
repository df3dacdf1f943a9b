use crate::common::info_hash::InfoHash;

/// Everything the engine surfaces to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TorrentAdded(InfoHash),
    /// Metadata is present and storage is wired; the torrent can transfer.
    TorrentReady(InfoHash),
    TorrentComplete(InfoHash),
    TorrentRemoved(InfoHash),
    PieceCompleted {
        info_hash: InfoHash,
        piece: u32,
    },
    /// The assembled and verified info dict of a magnet-sourced torrent.
    MetadataResolved {
        info_hash: InfoHash,
        info_bytes: Vec<u8>,
    },
    TorrentError {
        info_hash: InfoHash,
        message: String,
    },
    /// Internal counters disagreed; surfaced for the host to diagnose.
    InvariantViolation {
        info_hash: InfoHash,
        description: String,
    },
}
