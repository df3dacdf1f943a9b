use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use super::routing_table::{NodeId, K};

/// Kademlia parallelism factor.
pub const ALPHA: usize = 3;

/// What one queried node answered.
#[derive(Debug, Clone, Default)]
pub struct GetPeersReply {
    pub responder: NodeId,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

/// Transport the lookup issues `get_peers` through. The production
/// implementation rides the KRPC socket; tests plug in a mock network.
pub trait LookupTransport {
    fn get_peers(&self, node: SocketAddr, target: &NodeId) -> Option<GetPeersReply>;
}

/// Everything an iterative lookup produced.
#[derive(Debug, Default)]
pub struct LookupResult {
    pub peers: Vec<SocketAddr>,
    /// Announce tokens per responding endpoint.
    pub tokens: HashMap<SocketAddr, (Vec<u8>, NodeId)>,
    /// The up-to-K closest responding nodes, sorted by XOR distance.
    pub closest_nodes: Vec<(NodeId, SocketAddr)>,
    pub queried_count: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    addr: SocketAddr,
}

/// Iterative get_peers lookup: repeatedly queries the α closest unqueried
/// candidates, merging returned nodes, until no candidate remains closer
/// than the K closest responders.
pub fn iterative_lookup(
    transport: &dyn LookupTransport,
    target: &NodeId,
    seeds: Vec<(NodeId, SocketAddr)>,
    k: usize,
) -> LookupResult {
    let mut result = LookupResult::default();

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut known: HashSet<SocketAddr> = HashSet::new();
    for (id, addr) in seeds {
        if known.insert(addr) {
            candidates.push(Candidate { id, addr });
        }
    }

    let mut queried: HashSet<SocketAddr> = HashSet::new();
    let mut responded: Vec<Candidate> = Vec::new();
    let mut peers: HashSet<SocketAddr> = HashSet::new();

    loop {
        sort_by_distance(&mut candidates, target);

        // the k-th closest responder bounds how far we keep digging
        let frontier = responded
            .get(k.saturating_sub(1))
            .map(|c| c.id.distance(target));

        let batch: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !queried.contains(&c.addr))
            .filter(|c| match &frontier {
                Some(frontier) => c.id.distance(target) < *frontier,
                None => true,
            })
            .take(ALPHA)
            .cloned()
            .collect();

        if batch.is_empty() {
            break;
        }

        for candidate in batch {
            queried.insert(candidate.addr);
            result.queried_count += 1;

            let reply = match transport.get_peers(candidate.addr, target) {
                Some(reply) => reply,
                None => continue,
            };

            responded.push(candidate.clone());
            sort_by_distance(&mut responded, target);

            if let Some(token) = reply.token {
                result
                    .tokens
                    .insert(candidate.addr, (token, reply.responder));
            }
            peers.extend(reply.peers);
            for (id, addr) in reply.nodes {
                if known.insert(addr) {
                    candidates.push(Candidate { id, addr });
                }
            }
        }
    }

    responded.truncate(k);
    result.closest_nodes = responded.into_iter().map(|c| (c.id, c.addr)).collect();
    result.peers = peers.into_iter().collect();
    result
}

/// Convenience wrapper using the standard bucket size.
pub fn lookup(
    transport: &dyn LookupTransport,
    target: &NodeId,
    seeds: Vec<(NodeId, SocketAddr)>,
) -> LookupResult {
    iterative_lookup(transport, target, seeds, K)
}

fn sort_by_distance(candidates: &mut [Candidate], target: &NodeId) {
    candidates.sort_by_key(|c| c.id.distance(target));
}
