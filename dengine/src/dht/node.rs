use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adapters::socket::DatagramSocket;
use crate::common::info_hash::InfoHash;

use super::krpc::{
    KrpcMessage, KrpcQuery, KrpcResponse, PendingSlot, QueryOutcome, TransactionTable,
};
use super::lookup::{self, GetPeersReply, LookupResult, LookupTransport};
use super::routing_table::{AddNodeResult, NodeEntry, NodeId, RoutingTable, K};
use super::token_store::TokenStore;

/// Well-known bootstrap entry points.
pub const DEFAULT_BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

/// Per-query timeout (BEP-5 traffic is fire-and-forget fast).
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Retries used during bootstrap only.
const BOOTSTRAP_RETRIES: usize = 2;
/// Announced peers are served for this long.
const PEER_TTL: Duration = Duration::from_secs(30 * 60);
/// How long a stalest-entry ping may stay unanswered before replacement.
const REPLACEMENT_TIMEOUT: Duration = Duration::from_secs(3);

struct PendingReplacement {
    stale: NodeId,
    candidate: (NodeId, SocketAddr),
    slot: Arc<PendingSlot>,
    deadline: Instant,
}

/// The local Kademlia node: routing table, KRPC socket pump, token store
/// and announced-peer storage.
///
/// `start` spawns the socket pump; queries from other threads rendezvous
/// with it through the transaction table.
pub struct DhtNode {
    node_id: NodeId,
    socket: Arc<dyn DatagramSocket>,
    routing_table: Mutex<RoutingTable>,
    token_store: Mutex<TokenStore>,
    transactions: Mutex<TransactionTable>,
    peer_store: Mutex<HashMap<InfoHash, HashMap<SocketAddr, Instant>>>,
    pending_replacements: Mutex<Vec<PendingReplacement>>,
    running: AtomicBool,
}

impl DhtNode {
    pub fn new(node_id: NodeId, socket: Box<dyn DatagramSocket>) -> Arc<DhtNode> {
        Arc::new(DhtNode {
            node_id,
            socket: Arc::from(socket),
            routing_table: Mutex::new(RoutingTable::new(node_id, Instant::now())),
            token_store: Mutex::new(TokenStore::new(Instant::now())),
            transactions: Mutex::new(TransactionTable::new()),
            peer_store: Mutex::new(HashMap::new()),
            pending_replacements: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Spawns the socket pump thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        self.socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        let node = self.clone();
        let builder = thread::Builder::new().name("dht-pump".to_string());
        builder.spawn(move || node.pump())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn pump(&self) {
        let mut buffer = [0u8; 2048];
        let mut last_maintenance = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buffer) {
                Ok((length, from)) => self.handle_datagram(&buffer[..length], from),
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!("dht socket error: {}", err);
                    break;
                }
            }

            let now = Instant::now();
            if now.duration_since(last_maintenance) >= Duration::from_secs(5) {
                last_maintenance = now;
                self.maintenance(now);
            }
        }
    }

    fn maintenance(&self, now: Instant) {
        self.token_store.lock().unwrap().maybe_rotate(now);
        self.transactions
            .lock()
            .unwrap()
            .expire_older_than(Duration::from_secs(10), now);

        // announced peers expire
        let mut store = self.peer_store.lock().unwrap();
        for peers in store.values_mut() {
            peers.retain(|_, announced| now.duration_since(*announced) < PEER_TTL);
        }
        store.retain(|_, peers| !peers.is_empty());
        drop(store);

        // revalidate questionable nodes so lookups keep getting candidates
        let questionable: Vec<SocketAddr> = {
            let table = self.routing_table.lock().unwrap();
            table
                .all_entries()
                .iter()
                .filter(|e| e.is_questionable(now))
                .take(4)
                .map(|e| e.addr)
                .collect()
        };
        for addr in questionable {
            self.ping_node(addr);
        }

        // refresh buckets nothing has touched in a while
        let refresh_targets: Vec<(NodeId, SocketAddr)> = {
            let table = self.routing_table.lock().unwrap();
            table
                .stale_buckets(now, Duration::from_secs(15 * 60))
                .iter()
                .filter_map(|b| b.entries().first().map(|e| (*b.prefix(), e.addr)))
                .collect()
        };
        for (target, addr) in refresh_targets {
            let _ = self.send_query_nowait(
                addr,
                KrpcQuery::FindNode {
                    id: self.node_id,
                    target,
                },
            );
        }

        // stalest-entry pings that never came back
        let mut replacements = self.pending_replacements.lock().unwrap();
        let mut keep = Vec::new();
        for replacement in replacements.drain(..) {
            match replacement.slot.try_get() {
                Some(QueryOutcome::Response(_)) => {
                    // the stale node answered; it stays
                }
                Some(_) => self.apply_replacement(&replacement, now),
                None if now >= replacement.deadline => {
                    self.apply_replacement(&replacement, now)
                }
                None => keep.push(replacement),
            }
        }
        *replacements = keep;
    }

    fn apply_replacement(&self, replacement: &PendingReplacement, now: Instant) {
        debug!("replacing stale dht node {}", replacement.stale);
        self.routing_table.lock().unwrap().replace(
            &replacement.stale,
            replacement.candidate.0,
            replacement.candidate.1,
            now,
        );
    }

    // ------------------------------------------------------------------------------------------------
    // Incoming traffic

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let message = match KrpcMessage::decode(data) {
            Ok(message) => message,
            Err(err) => {
                debug!("undecodable krpc datagram from {}: {:?}", from, err);
                return;
            }
        };
        match message {
            KrpcMessage::Query { txn, query } => {
                let response = self.handle_query(&query, from);
                self.offer_node(*query_id(&query), from);
                let reply = KrpcMessage::Response {
                    txn,
                    response,
                };
                if let Err(err) = self.socket.send_to(&reply.encode(), from) {
                    debug!("failed to answer {}: {}", from, err);
                }
            }
            KrpcMessage::Response { txn, response } => {
                self.routing_table
                    .lock()
                    .unwrap()
                    .mark_seen(&response.id, Instant::now());
                self.offer_node(response.id, from);
                self.transactions
                    .lock()
                    .unwrap()
                    .resolve(&txn, QueryOutcome::Response(response));
            }
            KrpcMessage::Error { txn, code, message } => {
                self.transactions
                    .lock()
                    .unwrap()
                    .resolve(&txn, QueryOutcome::Error { code, message });
            }
        }
    }

    fn handle_query(&self, query: &KrpcQuery, from: SocketAddr) -> KrpcResponse {
        let now = Instant::now();
        match query {
            KrpcQuery::Ping { .. } => KrpcResponse {
                id: self.node_id,
                ..Default::default()
            },
            KrpcQuery::FindNode { target, .. } => KrpcResponse {
                id: self.node_id,
                nodes: self.closest_as_pairs(target, now),
                ..Default::default()
            },
            KrpcQuery::GetPeers { info_hash, .. } => {
                let token = self.token_store.lock().unwrap().generate(&from.ip());
                let stored: Vec<SocketAddr> = self
                    .peer_store
                    .lock()
                    .unwrap()
                    .get(info_hash)
                    .map(|peers| peers.keys().copied().collect())
                    .unwrap_or_default();
                let nodes = if stored.is_empty() {
                    self.closest_as_pairs(&NodeId(*info_hash.as_bytes()), now)
                } else {
                    Vec::new()
                };
                KrpcResponse {
                    id: self.node_id,
                    nodes,
                    values: stored,
                    token: Some(token),
                }
            }
            KrpcQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                let valid = self.token_store.lock().unwrap().validate(&from.ip(), token);
                if valid {
                    let peer_port = if *implied_port { from.port() } else { *port };
                    let peer = SocketAddr::new(from.ip(), peer_port);
                    self.peer_store
                        .lock()
                        .unwrap()
                        .entry(*info_hash)
                        .or_default()
                        .insert(peer, now);
                } else {
                    debug!("rejected announce with bad token from {}", from);
                }
                KrpcResponse {
                    id: self.node_id,
                    ..Default::default()
                }
            }
        }
    }

    fn closest_as_pairs(&self, target: &NodeId, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        self.routing_table
            .lock()
            .unwrap()
            .closest_nodes(target, K, now)
            .into_iter()
            .map(|e| (e.id, e.addr))
            .collect()
    }

    /// Offers a freshly seen node to the routing table, pinging the stalest
    /// entry of a full far bucket instead of evicting it outright.
    fn offer_node(&self, id: NodeId, addr: SocketAddr) {
        let now = Instant::now();
        let result = self.routing_table.lock().unwrap().add_node(id, addr, now);
        if let AddNodeResult::PingStalest(stale) = result {
            let stale_addr = {
                let table = self.routing_table.lock().unwrap();
                table
                    .all_entries()
                    .iter()
                    .find(|e| e.id == stale)
                    .map(|e| e.addr)
            };
            let stale_addr = match stale_addr {
                Some(addr) => addr,
                None => return,
            };
            let mut replacements = self.pending_replacements.lock().unwrap();
            if replacements.iter().any(|r| r.stale == stale) {
                return;
            }
            let slot = self.send_query_nowait(
                stale_addr,
                KrpcQuery::Ping { id: self.node_id },
            );
            if let Some(slot) = slot {
                replacements.push(PendingReplacement {
                    stale,
                    candidate: (id, addr),
                    slot,
                    deadline: now + REPLACEMENT_TIMEOUT,
                });
            }
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Outgoing queries

    fn send_query_nowait(
        &self,
        addr: SocketAddr,
        query: KrpcQuery,
    ) -> Option<Arc<PendingSlot>> {
        let (txn, slot) = self.transactions.lock().unwrap().register();
        let message = KrpcMessage::Query { txn: txn.clone(), query };
        match self.socket.send_to(&message.encode(), addr) {
            Ok(_) => Some(slot),
            Err(err) => {
                debug!("failed to send query to {}: {}", addr, err);
                self.transactions.lock().unwrap().forget(&txn);
                None
            }
        }
    }

    /// Fire-and-forget ping, e.g. for a peer's PORT message. The pump adds
    /// the node to the routing table when it answers.
    pub fn ping_node(&self, addr: SocketAddr) {
        let _ = self.send_query_nowait(addr, KrpcQuery::Ping { id: self.node_id });
    }

    /// Sends a query and blocks for the response or the 1-second timeout.
    pub fn send_query(&self, addr: SocketAddr, query: KrpcQuery) -> QueryOutcome {
        let (txn, slot) = self.transactions.lock().unwrap().register();
        let message = KrpcMessage::Query { txn: txn.clone(), query };
        if let Err(err) = self.socket.send_to(&message.encode(), addr) {
            debug!("failed to send query to {}: {}", addr, err);
            self.transactions.lock().unwrap().forget(&txn);
            return QueryOutcome::Timeout;
        }
        let outcome = slot.wait(QUERY_TIMEOUT);
        if outcome == QueryOutcome::Timeout {
            self.transactions.lock().unwrap().forget(&txn);
        }
        outcome
    }

    /// Seeds the routing table from bootstrap hosts by locating our own ID.
    pub fn bootstrap(&self, bootstrap_hosts: &[String]) {
        for host in bootstrap_hosts {
            let addrs = match host.to_socket_addrs() {
                Ok(addrs) => addrs.collect::<Vec<_>>(),
                Err(err) => {
                    warn!("cannot resolve bootstrap host {}: {}", host, err);
                    continue;
                }
            };
            for addr in addrs.into_iter().filter(|a| a.is_ipv4()) {
                for _ in 0..=BOOTSTRAP_RETRIES {
                    let outcome = self.send_query(
                        addr,
                        KrpcQuery::FindNode {
                            id: self.node_id,
                            target: self.node_id,
                        },
                    );
                    if let QueryOutcome::Response(response) = outcome {
                        for (id, node_addr) in response.nodes {
                            self.offer_node(id, node_addr);
                        }
                        break;
                    }
                }
            }
        }
        debug!(
            "bootstrap done, {} nodes known",
            self.routing_table.lock().unwrap().node_count()
        );
    }

    /// Iterative get_peers lookup for a torrent.
    pub fn find_peers(&self, info_hash: &InfoHash) -> LookupResult {
        let target = NodeId(*info_hash.as_bytes());
        let seeds = self.closest_as_pairs(&target, Instant::now());
        lookup::lookup(&NodeTransport { node: self, info_hash: *info_hash }, &target, seeds)
    }

    /// Announces our presence for `info_hash` to the closest responding
    /// nodes found by a fresh lookup. Returns how many accepted.
    pub fn announce(&self, info_hash: &InfoHash, port: u16) -> usize {
        let result = self.find_peers(info_hash);
        let mut accepted = 0;
        for (_, addr) in &result.closest_nodes {
            let (token, _) = match result.tokens.get(addr) {
                Some(entry) => entry.clone(),
                None => continue,
            };
            let outcome = self.send_query(
                *addr,
                KrpcQuery::AnnouncePeer {
                    id: self.node_id,
                    info_hash: *info_hash,
                    port,
                    token,
                    implied_port: false,
                },
            );
            if matches!(outcome, QueryOutcome::Response(_)) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Snapshot of the routing table for persistence.
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        self.routing_table.lock().unwrap().all_entries()
    }

    /// Restores previously persisted nodes.
    pub fn restore(&self, entries: Vec<(NodeId, SocketAddr)>) {
        let now = Instant::now();
        let mut table = self.routing_table.lock().unwrap();
        for (id, addr) in entries {
            table.add_node(id, addr, now);
        }
    }

    pub fn node_count(&self) -> usize {
        self.routing_table.lock().unwrap().node_count()
    }

    /// Peers stored for an infohash by remote announces.
    pub fn stored_peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        self.peer_store
            .lock()
            .unwrap()
            .get(info_hash)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }
}

struct NodeTransport<'a> {
    node: &'a DhtNode,
    info_hash: InfoHash,
}

impl LookupTransport for NodeTransport<'_> {
    fn get_peers(&self, node: SocketAddr, _target: &NodeId) -> Option<GetPeersReply> {
        let outcome = self.node.send_query(
            node,
            KrpcQuery::GetPeers {
                id: self.node.node_id,
                info_hash: self.info_hash,
            },
        );
        match outcome {
            QueryOutcome::Response(response) => Some(GetPeersReply {
                responder: response.id,
                nodes: response.nodes,
                peers: response.values,
                token: response.token,
            }),
            _ => None,
        }
    }
}

fn query_id(query: &KrpcQuery) -> &NodeId {
    match query {
        KrpcQuery::Ping { id } => id,
        KrpcQuery::FindNode { id, .. } => id,
        KrpcQuery::GetPeers { id, .. } => id,
        KrpcQuery::AnnouncePeer { id, .. } => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex as StdMutex;

    /// Socket stub that records outbound datagrams and never receives.
    struct CapturingSocket {
        sent: StdMutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl CapturingSocket {
        fn new() -> CapturingSocket {
            CapturingSocket {
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl DatagramSocket for CapturingSocket {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((buf.to_vec(), addr));
            Ok(buf.len())
        }

        fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "no traffic"))
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn local_port(&self) -> io::Result<u16> {
            Ok(6881)
        }
    }

    #[test]
    fn test_ping_query_is_answered() {
        let (node, socket) = build_node();
        let query = KrpcMessage::Query {
            txn: b"aa".to_vec(),
            query: KrpcQuery::Ping { id: remote_id(1) },
        };

        node.handle_datagram(&query.encode(), remote_addr(1));

        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let reply = KrpcMessage::decode(&sent[0].0).unwrap();
        match reply {
            KrpcMessage::Response { txn, response } => {
                assert_eq!(txn, b"aa".to_vec());
                assert_eq!(response.id, node.node_id());
            }
            other => panic!("expected response, got {:?}", other),
        }
        // the querier landed in the routing table
        assert_eq!(node.node_count(), 1);
    }

    #[test]
    fn test_get_peers_returns_token_and_nodes() {
        let (node, socket) = build_node();
        // seed the table so find_node/get_peers has something to return
        node.restore(vec![(remote_id(5), remote_addr(5))]);

        let query = KrpcMessage::Query {
            txn: b"bb".to_vec(),
            query: KrpcQuery::GetPeers {
                id: remote_id(1),
                info_hash: InfoHash::new([7; 20]),
            },
        };
        node.handle_datagram(&query.encode(), remote_addr(1));

        let sent = socket.sent.lock().unwrap();
        let reply = KrpcMessage::decode(&sent[0].0).unwrap();
        match reply {
            KrpcMessage::Response { response, .. } => {
                assert!(response.token.is_some());
                assert!(!response.nodes.is_empty());
                assert!(response.values.is_empty());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_announce_flow_stores_peer() {
        let (node, socket) = build_node();

        // obtain a token the proper way
        let get_peers = KrpcMessage::Query {
            txn: b"cc".to_vec(),
            query: KrpcQuery::GetPeers {
                id: remote_id(1),
                info_hash: InfoHash::new([7; 20]),
            },
        };
        node.handle_datagram(&get_peers.encode(), remote_addr(1));
        let token = {
            let sent = socket.sent.lock().unwrap();
            match KrpcMessage::decode(&sent[0].0).unwrap() {
                KrpcMessage::Response { response, .. } => response.token.unwrap(),
                other => panic!("expected response, got {:?}", other),
            }
        };

        let announce = KrpcMessage::Query {
            txn: b"cd".to_vec(),
            query: KrpcQuery::AnnouncePeer {
                id: remote_id(1),
                info_hash: InfoHash::new([7; 20]),
                port: 7777,
                token,
                implied_port: false,
            },
        };
        node.handle_datagram(&announce.encode(), remote_addr(1));

        let stored = node.stored_peers(&InfoHash::new([7; 20]));
        assert_eq!(stored, vec![SocketAddr::new(remote_addr(1).ip(), 7777)]);

        // a later get_peers returns the stored peer as a value
        let again = KrpcMessage::Query {
            txn: b"ce".to_vec(),
            query: KrpcQuery::GetPeers {
                id: remote_id(2),
                info_hash: InfoHash::new([7; 20]),
            },
        };
        node.handle_datagram(&again.encode(), remote_addr(2));
        let sent = socket.sent.lock().unwrap();
        match KrpcMessage::decode(&sent.last().unwrap().0).unwrap() {
            KrpcMessage::Response { response, .. } => {
                assert_eq!(response.values.len(), 1);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_announce_with_bad_token_is_ignored() {
        let (node, _socket) = build_node();

        let announce = KrpcMessage::Query {
            txn: b"cf".to_vec(),
            query: KrpcQuery::AnnouncePeer {
                id: remote_id(1),
                info_hash: InfoHash::new([7; 20]),
                port: 7777,
                token: b"forged".to_vec(),
                implied_port: false,
            },
        };
        node.handle_datagram(&announce.encode(), remote_addr(1));

        assert!(node.stored_peers(&InfoHash::new([7; 20])).is_empty());
    }

    #[test]
    fn test_implied_port_uses_source_port() {
        let (node, socket) = build_node();
        let info_hash = InfoHash::new([7; 20]);

        let get_peers = KrpcMessage::Query {
            txn: b"cg".to_vec(),
            query: KrpcQuery::GetPeers {
                id: remote_id(1),
                info_hash,
            },
        };
        node.handle_datagram(&get_peers.encode(), remote_addr(1));
        let token = {
            let sent = socket.sent.lock().unwrap();
            match KrpcMessage::decode(&sent[0].0).unwrap() {
                KrpcMessage::Response { response, .. } => response.token.unwrap(),
                other => panic!("expected response, got {:?}", other),
            }
        };

        let announce = KrpcMessage::Query {
            txn: b"ch".to_vec(),
            query: KrpcQuery::AnnouncePeer {
                id: remote_id(1),
                info_hash,
                port: 7777,
                token,
                implied_port: true,
            },
        };
        node.handle_datagram(&announce.encode(), remote_addr(1));

        assert_eq!(node.stored_peers(&info_hash), vec![remote_addr(1)]);
    }

    #[test]
    fn test_response_datagram_resolves_transaction() {
        let (node, _socket) = build_node();
        let (txn, slot) = node.transactions.lock().unwrap().register();

        let response = KrpcMessage::Response {
            txn,
            response: KrpcResponse {
                id: remote_id(3),
                ..Default::default()
            },
        };
        node.handle_datagram(&response.encode(), remote_addr(3));

        match slot.wait(Duration::from_millis(10)) {
            QueryOutcome::Response(r) => assert_eq!(r.id, remote_id(3)),
            other => panic!("expected response, got {:?}", other),
        }
        assert_eq!(node.node_count(), 1);
    }

    // Auxiliary functions

    fn build_node() -> (Arc<DhtNode>, Arc<CapturingSocket>) {
        let socket = Arc::new(CapturingSocket::new());
        let node = DhtNode::new(NodeId([0; 20]), Box::new(SocketHandle(socket.clone())));
        (node, socket)
    }

    struct SocketHandle(Arc<CapturingSocket>);

    impl DatagramSocket for SocketHandle {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.send_to(buf, addr)
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.0.recv_from(buf)
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.0.set_read_timeout(timeout)
        }

        fn local_port(&self) -> io::Result<u16> {
            self.0.local_port()
        }
    }

    fn remote_id(byte: u8) -> NodeId {
        NodeId([byte; 20])
    }

    fn remote_addr(host: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", host).parse().unwrap()
    }
}
