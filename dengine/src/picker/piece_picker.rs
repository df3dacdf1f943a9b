use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::bitfield::Bitfield;
use crate::peer::connection::ConnectionId;

use super::active_piece::{ActivePiece, ReceiveOutcome, BLOCK_SIZE};
use super::buffer_pool::PieceBufferPool;
use super::file_priority::PieceClass;

const MAX_POOLED_BUFFERS: usize = 32;
const MAX_OUTSTANDING_BLOCKS: u32 = 2048;

/// A block request to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRequest {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// A cancel to put on the wire, addressed to the peer holding the request.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOrder {
    pub peer: ConnectionId,
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// Result of feeding a received block into the picker.
#[derive(Debug, PartialEq)]
pub enum BlockReceived {
    /// Block stored, piece still incomplete.
    Progress { cancel: Option<CancelOrder> },
    /// Last block stored; the piece is Pending, awaiting hash verification.
    PieceComplete { cancel: Option<CancelOrder> },
    /// Stale, duplicate or unknown block; dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveState {
    /// Has at least one unrequested block; counts against the partial cap.
    Partial,
    /// All blocks requested, not all received.
    Full,
}

struct ActiveEntry {
    piece: ActivePiece,
    state: ActiveState,
}

/// Per-torrent piece selection and request pipeline state.
///
/// Pieces in flight are Partial (unrequested blocks remain), Full (all
/// blocks requested) or Pending (all blocks received, awaiting hashing).
/// Only Partial pieces count against the cap, so one fast peer can deepen
/// its pipeline by promoting pieces to Full without starving the set.
pub struct PiecePicker {
    piece_count: u32,
    piece_length: u32,
    total_length: u64,
    availability: Vec<u16>,
    seed_count: u16,
    have: Bitfield,
    classes: Vec<PieceClass>,
    parts: Bitfield,
    active: HashMap<u32, ActiveEntry>,
    pending: HashMap<u32, ActivePiece>,
    partial_count: usize,
    pool: PieceBufferPool,
    requests_pending: HashMap<ConnectionId, usize>,
}

impl PiecePicker {
    pub fn new(piece_length: u32, total_length: u64, classes: Vec<PieceClass>) -> PiecePicker {
        let piece_count =
            ((total_length + piece_length as u64 - 1) / piece_length as u64) as u32;
        PiecePicker {
            piece_count,
            piece_length,
            total_length,
            availability: vec![0; piece_count as usize],
            seed_count: 0,
            have: Bitfield::new(piece_count as usize),
            classes,
            parts: Bitfield::new(piece_count as usize),
            active: HashMap::new(),
            pending: HashMap::new(),
            partial_count: 0,
            pool: PieceBufferPool::new(piece_length as usize, MAX_POOLED_BUFFERS),
            requests_pending: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Owned pieces and classes

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn have_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn have_count(&self) -> usize {
        self.have.count()
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    /// Restores the owned set, e.g. after a recheck.
    pub fn set_have_bitfield(&mut self, have: Bitfield) {
        self.have = have;
    }

    pub fn mark_have(&mut self, piece: u32) {
        self.have.set(piece as usize, true);
    }

    pub fn set_classes(&mut self, classes: Vec<PieceClass>) {
        self.classes = classes;
    }

    pub fn set_in_parts(&mut self, piece: u32, in_parts: bool) {
        self.parts.set(piece as usize, in_parts);
    }

    pub fn parts_mask(&self) -> &Bitfield {
        &self.parts
    }

    // ------------------------------------------------------------------------------------------------
    // Availability

    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        if bitfield.is_complete() {
            self.seed_count = self.seed_count.saturating_add(1);
            return;
        }
        for i in 0..self.piece_count as usize {
            if bitfield.get(i) {
                self.availability[i] = self.availability[i].saturating_add(1);
            }
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        if bitfield.is_complete() {
            self.seed_count = self.seed_count.saturating_sub(1);
            return;
        }
        for i in 0..self.piece_count as usize {
            if bitfield.get(i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
    }

    pub fn add_have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count = count.saturating_add(1);
        }
    }

    /// A peer's bitfield just became complete: its per-piece contribution
    /// moves into the seed counter. `bitfield` is the now-complete field.
    pub fn promote_to_seed(&mut self, bitfield: &Bitfield) {
        for i in 0..self.piece_count as usize {
            if bitfield.get(i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        self.seed_count = self.seed_count.saturating_add(1);
    }

    /// A seed disconnected.
    pub fn remove_seed(&mut self) {
        self.seed_count = self.seed_count.saturating_sub(1);
    }

    pub fn seed_count(&self) -> u16 {
        self.seed_count
    }

    pub fn effective_availability(&self, piece: u32) -> u32 {
        self.availability[piece as usize] as u32 + self.seed_count as u32
    }

    // ------------------------------------------------------------------------------------------------
    // Selection

    /// Whether the piece may be requested at all: not owned, not blacklisted
    /// by file priorities, not parked in the parts file.
    pub fn should_request_piece(&self, piece: u32) -> bool {
        let index = piece as usize;
        if index >= self.piece_count as usize || self.have.get(index) || self.parts.get(index) {
            return false;
        }
        !matches!(self.classes.get(index), Some(PieceClass::Blacklisted))
    }

    /// Whether the peer advertises any piece we still want.
    pub fn is_interesting(&self, peer_has: &Bitfield, peer_is_seed: bool) -> bool {
        (0..self.piece_count).any(|i| {
            self.should_request_piece(i) && (peer_is_seed || peer_has.get(i as usize))
        })
    }

    /// Cap on simultaneously Partial pieces.
    pub fn partial_cap(&self, connected_peers: usize) -> usize {
        let blocks_per_piece = ((self.piece_length + BLOCK_SIZE - 1) / BLOCK_SIZE).max(1);
        let by_depth = (MAX_OUTSTANDING_BLOCKS / blocks_per_piece) as usize;
        let by_peers = connected_peers.saturating_mul(3) / 2;
        by_peers.min(by_depth).max(1)
    }

    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count {
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

    /// Picks up to `max` blocks for the peer, preferring blocks of pieces
    /// already in flight, then starting new pieces rarest-first while under
    /// the partial cap.
    pub fn next_requests(
        &mut self,
        peer: ConnectionId,
        peer_has: &Bitfield,
        peer_is_seed: bool,
        max: usize,
        connected_peers: usize,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let mut requests = Vec::new();
        while requests.len() < max {
            let piece_index = match self.pick_partial_for(peer_has, peer_is_seed) {
                Some(index) => index,
                None => match self.start_new_piece(peer_has, peer_is_seed, connected_peers, now) {
                    Some(index) => index,
                    None => break,
                },
            };

            let entry = match self.active.get_mut(&piece_index) {
                Some(entry) => entry,
                None => break,
            };
            let block = match entry.piece.next_unrequested_block() {
                Some(block) => block,
                None => break,
            };
            entry.piece.mark_requested(block, peer, now);
            requests.push(BlockRequest {
                piece: piece_index,
                begin: block * BLOCK_SIZE,
                length: entry.piece.block_length(block),
            });
            *self.requests_pending.entry(peer).or_insert(0) += 1;

            if !entry.piece.has_unrequested_block() && entry.state == ActiveState::Partial {
                entry.state = ActiveState::Full;
                self.partial_count -= 1;
            }
        }
        requests
    }

    // Rarest Partial piece the peer can serve.
    fn pick_partial_for(&self, peer_has: &Bitfield, peer_is_seed: bool) -> Option<u32> {
        self.active
            .iter()
            .filter(|(index, entry)| {
                entry.state == ActiveState::Partial
                    && (peer_is_seed || peer_has.get(**index as usize))
            })
            .map(|(index, _)| *index)
            .min_by_key(|index| (self.effective_availability(*index), *index))
    }

    // Starts the rarest startable piece if the partial cap allows it.
    fn start_new_piece(
        &mut self,
        peer_has: &Bitfield,
        peer_is_seed: bool,
        connected_peers: usize,
        now: Instant,
    ) -> Option<u32> {
        if self.partial_count >= self.partial_cap(connected_peers) {
            return None;
        }
        let candidate = (0..self.piece_count)
            .filter(|i| {
                self.should_request_piece(*i)
                    && !self.active.contains_key(i)
                    && !self.pending.contains_key(i)
                    && (peer_is_seed || peer_has.get(*i as usize))
            })
            .min_by_key(|i| (self.effective_availability(*i), *i))?;

        let size = self.piece_size(candidate);
        let buffer = self.pool.acquire(size as usize);
        self.active.insert(
            candidate,
            ActiveEntry {
                piece: ActivePiece::new(candidate, size, buffer, now),
                state: ActiveState::Partial,
            },
        );
        self.partial_count += 1;
        Some(candidate)
    }

    // ------------------------------------------------------------------------------------------------
    // Receipt, choke, timeouts

    /// Feeds a received block in; the buffer is filled in place.
    pub fn on_block_received(
        &mut self,
        peer: ConnectionId,
        piece: u32,
        begin: u32,
        data: &[u8],
        now: Instant,
    ) -> BlockReceived {
        if begin % BLOCK_SIZE != 0 {
            return BlockReceived::Ignored;
        }
        let block = begin / BLOCK_SIZE;
        let entry = match self.active.get_mut(&piece) {
            Some(entry) => entry,
            None => return BlockReceived::Ignored,
        };
        if entry.piece.block_length(block) as usize != data.len() {
            return BlockReceived::Ignored;
        }

        match entry.piece.mark_received(block, peer, data, now) {
            ReceiveOutcome::Duplicate => BlockReceived::Ignored,
            ReceiveOutcome::Stored { requested_from } => {
                if let Some(holder) = requested_from {
                    if let Some(count) = self.requests_pending.get_mut(&holder) {
                        *count = count.saturating_sub(1);
                    }
                }
                let cancel = requested_from.filter(|holder| *holder != peer).map(|holder| {
                    CancelOrder {
                        peer: holder,
                        piece,
                        begin,
                        length: data.len() as u32,
                    }
                });

                if entry.piece.all_received() {
                    let entry = self.active.remove(&piece).unwrap_or_else(|| unreachable!());
                    if entry.state == ActiveState::Partial {
                        self.partial_count -= 1;
                    }
                    self.pending.insert(piece, entry.piece);
                    BlockReceived::PieceComplete { cancel }
                } else {
                    BlockReceived::Progress { cancel }
                }
            }
        }
    }

    /// Takes a Pending piece for hashing. Removing it is what makes the
    /// piece re-selectable if the hash fails.
    pub fn take_pending(&mut self, piece: u32) -> Option<ActivePiece> {
        self.pending.remove(&piece)
    }

    pub fn pending_pieces(&self) -> Vec<u32> {
        self.pending.keys().copied().collect()
    }

    /// Returns a no-longer-needed piece buffer to the pool.
    pub fn release_buffer(&mut self, buffer: Vec<u8>) {
        self.pool.release(buffer);
    }

    /// Drops pooled buffers, e.g. on shutdown.
    pub fn clear_pool(&mut self) {
        self.pool.clear();
    }

    /// The peer choked us or vanished: every outstanding request to it is
    /// freed and its pending counter resets to zero.
    pub fn clear_requests_for_peer(&mut self, peer: ConnectionId) {
        for entry in self.active.values_mut() {
            let freed = entry.piece.clear_requests_for_peer(peer);
            if !freed.is_empty() && entry.state == ActiveState::Full {
                entry.state = ActiveState::Partial;
                self.partial_count += 1;
            }
        }
        self.requests_pending.insert(peer, 0);
    }

    pub fn peer_disconnected(&mut self, peer: ConnectionId) {
        self.clear_requests_for_peer(peer);
        self.requests_pending.remove(&peer);
    }

    /// Cancels requests older than `timeout`, re-marking their blocks
    /// unrequested.
    pub fn scan_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<CancelOrder> {
        let mut cancels = Vec::new();
        for (index, entry) in self.active.iter_mut() {
            for (block, peer) in entry.piece.stale_requests(now, timeout) {
                entry.piece.unrequest(block);
                if let Some(count) = self.requests_pending.get_mut(&peer) {
                    *count = count.saturating_sub(1);
                }
                cancels.push(CancelOrder {
                    peer,
                    piece: *index,
                    begin: block * BLOCK_SIZE,
                    length: entry.piece.block_length(block),
                });
            }
            if entry.piece.has_unrequested_block() && entry.state == ActiveState::Full {
                entry.state = ActiveState::Partial;
                self.partial_count += 1;
            }
        }
        cancels
    }

    // ------------------------------------------------------------------------------------------------
    // Introspection

    pub fn requests_pending(&self, peer: ConnectionId) -> usize {
        self.requests_pending.get(&peer).copied().unwrap_or(0)
    }

    /// Sum of every peer's pending counter, for invariant checks.
    pub fn sum_requests_pending(&self) -> usize {
        self.requests_pending.values().sum()
    }

    /// Total outstanding block requests, for invariant checks.
    pub fn outstanding_block_count(&self) -> usize {
        self.active.values().map(|e| e.piece.outstanding_count()).sum()
    }

    pub fn partial_count(&self) -> usize {
        self.partial_count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
