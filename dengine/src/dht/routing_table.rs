use std::fmt;
use std::fmt::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

/// Kademlia bucket size.
pub const K: usize = 8;

/// A node unseen for this long is questionable and gets revalidated before
/// being served as a lookup candidate.
const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// 160-bit DHT node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> NodeId {
        NodeId(rand::thread_rng().gen())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<NodeId> {
        if bytes.len() != 20 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Some(NodeId(id))
    }

    pub fn from_hex(hex: &str) -> Option<NodeId> {
        if hex.len() != 40 {
            return None;
        }
        let mut id = [0u8; 20];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(NodeId(id))
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(40);
        for byte in &self.0 {
            let _ = write!(&mut hex, "{:02x}", byte);
        }
        hex
    }

    /// XOR distance to another ID, comparable lexicographically.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// Value of the bit at `index`, most significant first.
    fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - index % 8)) & 1 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A remote node known to the routing table.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl NodeEntry {
    pub fn is_questionable(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) >= QUESTIONABLE_AFTER
    }
}

/// One bucket of the tree, covering the IDs that share `prefix_len` leading
/// bits with `prefix`.
#[derive(Debug)]
pub struct Bucket {
    prefix: NodeId,
    prefix_len: usize,
    entries: Vec<NodeEntry>,
    pub last_changed: Instant,
}

impl Bucket {
    fn contains(&self, id: &NodeId) -> bool {
        (0..self.prefix_len).all(|bit| id.bit(bit) == self.prefix.bit(bit))
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn prefix(&self) -> &NodeId {
        &self.prefix
    }
}

/// What the caller should do after offering a node to the table.
#[derive(Debug, PartialEq)]
pub enum AddNodeResult {
    Added,
    /// Node already present; its entry was refreshed.
    Updated,
    /// Bucket full and unsplittable: ping this stalest entry and call
    /// `replace` with the candidate only if the ping fails.
    PingStalest(NodeId),
}

/// Bucket-tree routing table (BEP-5).
///
/// Starts as one bucket over the whole space; only the bucket containing
/// the local ID splits when full.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, now: Instant) -> RoutingTable {
        RoutingTable {
            local_id,
            buckets: vec![Bucket {
                prefix: NodeId([0; 20]),
                prefix_len: 0,
                entries: Vec::new(),
                last_changed: now,
            }],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Offers a node to the table.
    pub fn add_node(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> AddNodeResult {
        if id == self.local_id {
            return AddNodeResult::Updated;
        }
        loop {
            let index = self.bucket_index(&id);
            let bucket = &mut self.buckets[index];

            if let Some(position) = bucket.entries.iter().position(|e| e.id == id) {
                // LRU: freshly seen nodes move to the tail
                let mut entry = bucket.entries.remove(position);
                entry.last_seen = now;
                entry.addr = addr;
                bucket.entries.push(entry);
                bucket.last_changed = now;
                return AddNodeResult::Updated;
            }

            if bucket.entries.len() < K {
                bucket.entries.push(NodeEntry {
                    id,
                    addr,
                    last_seen: now,
                });
                bucket.last_changed = now;
                return AddNodeResult::Added;
            }

            if bucket.contains(&self.local_id) {
                self.split(index, now);
                continue;
            }

            let stalest = bucket
                .entries
                .iter()
                .min_by_key(|e| e.last_seen)
                .map(|e| e.id);
            return match stalest {
                Some(stalest) => AddNodeResult::PingStalest(stalest),
                None => AddNodeResult::Added,
            };
        }
    }

    /// Replaces a stale entry with a candidate after its ping failed.
    pub fn replace(&mut self, stale: &NodeId, id: NodeId, addr: SocketAddr, now: Instant) {
        let index = self.bucket_index(stale);
        let bucket = &mut self.buckets[index];
        if let Some(position) = bucket.entries.iter().position(|e| e.id == *stale) {
            bucket.entries.remove(position);
        }
        // the candidate may belong to a different bucket than the stale node
        self.add_node(id, addr, now);
    }

    /// Marks a node as alive now (a response or query arrived from it).
    pub fn mark_seen(&mut self, id: &NodeId, now: Instant) {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        if let Some(entry) = bucket.entries.iter_mut().find(|e| e.id == *id) {
            entry.last_seen = now;
            bucket.last_changed = now;
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        bucket.entries.retain(|e| e.id != *id);
    }

    /// The up-to-`count` known nodes closest to `target` by XOR distance,
    /// excluding questionable ones.
    pub fn closest_nodes(&self, target: &NodeId, count: usize, now: Instant) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| !e.is_questionable(now))
            .cloned()
            .collect();
        nodes.sort_by_key(|e| e.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Buckets unchanged for longer than `staleness`, for refresh lookups.
    pub fn stale_buckets(&self, now: Instant, staleness: Duration) -> Vec<&Bucket> {
        self.buckets
            .iter()
            .filter(|b| now.duration_since(b.last_changed) >= staleness)
            .collect()
    }

    /// All entries, for persistence snapshots.
    pub fn all_entries(&self) -> Vec<NodeEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .cloned()
            .collect()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .unwrap_or(0)
    }

    fn split(&mut self, index: usize, now: Instant) {
        let bucket = self.buckets.remove(index);
        let prefix_len = bucket.prefix_len + 1;

        // the zero half keeps the parent prefix; the one half sets the new bit
        let mut one_prefix = bucket.prefix;
        one_prefix.0[bucket.prefix_len / 8] |= 1 << (7 - bucket.prefix_len % 8);

        let mut zero = Bucket {
            prefix: bucket.prefix,
            prefix_len,
            entries: Vec::new(),
            last_changed: now,
        };
        let mut one = Bucket {
            prefix: one_prefix,
            prefix_len,
            entries: Vec::new(),
            last_changed: now,
        };
        for entry in bucket.entries {
            if entry.id.bit(bucket.prefix_len) {
                one.entries.push(entry);
            } else {
                zero.entries.push(entry);
            }
        }

        self.buckets.push(zero);
        self.buckets.push(one);
    }
}
