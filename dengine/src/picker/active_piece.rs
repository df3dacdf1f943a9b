use std::collections::HashMap;
use std::time::Instant;

use crate::peer::connection::ConnectionId;

/// Wire block size (BEP-3).
pub const BLOCK_SIZE: u32 = 16384;

/// Outcome of storing a received block.
#[derive(Debug, PartialEq)]
pub enum ReceiveOutcome {
    /// Fresh block. `requested_from` is the peer whose outstanding request
    /// this receipt closes; when that is not the deliverer it should get a
    /// CANCEL.
    Stored {
        requested_from: Option<ConnectionId>,
    },
    /// The block was already received; the payload is dropped.
    Duplicate,
}

/// A piece currently being downloaded: its buffer plus per-block request and
/// receive bookkeeping.
#[derive(Debug)]
pub struct ActivePiece {
    index: u32,
    piece_length: u32,
    buffer: Vec<u8>,
    requested: Vec<bool>,
    received: Vec<bool>,
    /// Which peer the outstanding request for a block went to.
    request_peers: HashMap<u32, ConnectionId>,
    issued_at: HashMap<u32, Instant>,
    /// Which peer delivered each received block.
    contributors: HashMap<u32, ConnectionId>,
    last_activity: Instant,
}

impl ActivePiece {
    pub fn new(index: u32, piece_length: u32, buffer: Vec<u8>, now: Instant) -> ActivePiece {
        let blocks = Self::blocks_for(piece_length);
        ActivePiece {
            index,
            piece_length,
            buffer,
            requested: vec![false; blocks],
            received: vec![false; blocks],
            request_peers: HashMap::new(),
            issued_at: HashMap::new(),
            contributors: HashMap::new(),
            last_activity: now,
        }
    }

    fn blocks_for(piece_length: u32) -> usize {
        ((piece_length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn block_count(&self) -> u32 {
        self.requested.len() as u32
    }

    /// Byte length of the given block (the last one may be short).
    pub fn block_length(&self, block: u32) -> u32 {
        let begin = block * BLOCK_SIZE;
        (self.piece_length - begin).min(BLOCK_SIZE)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Lowest block that is neither requested nor received.
    pub fn next_unrequested_block(&self) -> Option<u32> {
        (0..self.block_count()).find(|b| {
            !self.requested[*b as usize] && !self.received[*b as usize]
        })
    }

    pub fn has_unrequested_block(&self) -> bool {
        self.next_unrequested_block().is_some()
    }

    pub fn all_received(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    pub fn received_count(&self) -> u32 {
        self.received.iter().filter(|r| **r).count() as u32
    }

    /// Marks a block as outstanding at `peer`.
    pub fn mark_requested(&mut self, block: u32, peer: ConnectionId, now: Instant) {
        let index = block as usize;
        if index >= self.requested.len() || self.received[index] {
            return;
        }
        self.requested[index] = true;
        self.request_peers.insert(block, peer);
        self.issued_at.insert(block, now);
    }

    /// Stores a received block into the piece buffer in place.
    pub fn mark_received(
        &mut self,
        block: u32,
        peer: ConnectionId,
        data: &[u8],
        now: Instant,
    ) -> ReceiveOutcome {
        let index = block as usize;
        if index >= self.received.len() || self.received[index] {
            return ReceiveOutcome::Duplicate;
        }
        let begin = (block * BLOCK_SIZE) as usize;
        let length = (self.block_length(block) as usize).min(data.len());
        self.buffer[begin..begin + length].copy_from_slice(&data[..length]);

        self.received[index] = true;
        self.requested[index] = true;
        self.contributors.insert(block, peer);
        self.issued_at.remove(&block);
        let requested_from = self.request_peers.remove(&block);
        self.last_activity = now;
        ReceiveOutcome::Stored { requested_from }
    }

    /// Re-marks a block as unrequested (cancel or timeout).
    pub fn unrequest(&mut self, block: u32) {
        let index = block as usize;
        if index < self.requested.len() && !self.received[index] {
            self.requested[index] = false;
            self.request_peers.remove(&block);
            self.issued_at.remove(&block);
        }
    }

    /// Clears every outstanding request held by `peer`, returning the freed
    /// blocks.
    pub fn clear_requests_for_peer(&mut self, peer: ConnectionId) -> Vec<u32> {
        let blocks: Vec<u32> = self
            .request_peers
            .iter()
            .filter(|(_, p)| **p == peer)
            .map(|(b, _)| *b)
            .collect();
        for block in &blocks {
            self.unrequest(*block);
        }
        blocks
    }

    /// Outstanding requests older than `timeout`.
    pub fn stale_requests(
        &self,
        now: Instant,
        timeout: std::time::Duration,
    ) -> Vec<(u32, ConnectionId)> {
        self.issued_at
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= timeout)
            .filter_map(|(block, _)| self.request_peers.get(block).map(|p| (*block, *p)))
            .collect()
    }

    /// Number of requested-but-not-received blocks.
    pub fn outstanding_count(&self) -> usize {
        self.request_peers.len()
    }

    /// Distinct peers that delivered at least one block.
    pub fn contributors(&self) -> Vec<ConnectionId> {
        let mut peers: Vec<ConnectionId> = self.contributors.values().copied().collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Hands the assembled buffer out without copying.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
