use std::sync::atomic::{AtomicU64, Ordering};

/// Traffic categories tracked for telemetry.
///
/// `PeerPayload` counts the block bytes inside `PeerProtocol` traffic, so it
/// is excluded from aggregate totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficCategory {
    PeerProtocol,
    PeerPayload,
    TrackerHttp,
    TrackerUdp,
    Dht,
    Disk,
}

const CATEGORY_COUNT: usize = 6;

fn category_index(category: TrafficCategory) -> usize {
    match category {
        TrafficCategory::PeerProtocol => 0,
        TrafficCategory::PeerPayload => 1,
        TrafficCategory::TrackerHttp => 2,
        TrafficCategory::TrackerUdp => 3,
        TrafficCategory::Dht => 4,
        TrafficCategory::Disk => 5,
    }
}

/// Categorized byte counters for one direction.
#[derive(Debug, Default)]
pub struct ByteAccounting {
    counters: [AtomicU64; CATEGORY_COUNT],
}

impl ByteAccounting {
    pub fn new() -> ByteAccounting {
        ByteAccounting::default()
    }

    pub fn record(&self, category: TrafficCategory, bytes: u64) {
        self.counters[category_index(category)].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_for(&self, category: TrafficCategory) -> u64 {
        self.counters[category_index(category)].load(Ordering::Relaxed)
    }

    /// Sum over all categories, with the payload subset excluded so protocol
    /// bytes are not counted twice.
    pub fn aggregate_total(&self) -> u64 {
        self.counters
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != category_index(TrafficCategory::PeerPayload))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// Byte accounting for both directions.
#[derive(Debug, Default)]
pub struct TrafficAccounting {
    pub received: ByteAccounting,
    pub sent: ByteAccounting,
}

impl TrafficAccounting {
    pub fn new() -> TrafficAccounting {
        TrafficAccounting::default()
    }
}
