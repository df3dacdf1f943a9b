use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bencoder::bencode::{Bencode, BencodeError};

use crate::common::info_hash::InfoHash;

use super::routing_table::NodeId;

/// Compact node info length: 20-byte id, 4-byte IPv4, 2-byte port.
const COMPACT_NODE_LENGTH: usize = 26;
/// Compact peer length: 4-byte IPv4, 2-byte port.
const COMPACT_PEER_LENGTH: usize = 6;

/// A query as defined by BEP-5.
#[derive(Debug, Clone, PartialEq)]
pub enum KrpcQuery {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

/// The `r` dict of a response; which fields are present depends on the
/// query that was answered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KrpcResponse {
    pub id: NodeId,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

/// One KRPC datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum KrpcMessage {
    Query { txn: Vec<u8>, query: KrpcQuery },
    Response { txn: Vec<u8>, response: KrpcResponse },
    Error { txn: Vec<u8>, code: i64, message: String },
}

/// Possible KRPC codec errors.
#[derive(Debug, PartialEq)]
pub enum KrpcError {
    MalformedBencode(BencodeError),
    NotADict,
    MissingField(&'static str),
    UnknownMessageType,
    UnknownQuery(String),
}

impl KrpcMessage {
    pub fn txn(&self) -> &[u8] {
        match self {
            KrpcMessage::Query { txn, .. } => txn,
            KrpcMessage::Response { txn, .. } => txn,
            KrpcMessage::Error { txn, .. } => txn,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            KrpcMessage::Query { txn, query } => {
                dict.insert(b"t".to_vec(), Bencode::BString(txn.clone()));
                dict.insert(b"y".to_vec(), Bencode::BString(b"q".to_vec()));
                let (name, args) = Self::encode_query(query);
                dict.insert(b"q".to_vec(), Bencode::BString(name));
                dict.insert(b"a".to_vec(), Bencode::BDict(args));
            }
            KrpcMessage::Response { txn, response } => {
                dict.insert(b"t".to_vec(), Bencode::BString(txn.clone()));
                dict.insert(b"y".to_vec(), Bencode::BString(b"r".to_vec()));
                dict.insert(b"r".to_vec(), Bencode::BDict(Self::encode_response(response)));
            }
            KrpcMessage::Error { txn, code, message } => {
                dict.insert(b"t".to_vec(), Bencode::BString(txn.clone()));
                dict.insert(b"y".to_vec(), Bencode::BString(b"e".to_vec()));
                dict.insert(
                    b"e".to_vec(),
                    Bencode::BList(vec![
                        Bencode::BNumber(*code),
                        Bencode::BString(message.as_bytes().to_vec()),
                    ]),
                );
            }
        }
        Bencode::encode(&Bencode::BDict(dict))
    }

    fn encode_query(query: &KrpcQuery) -> (Vec<u8>, BTreeMap<Vec<u8>, Bencode>) {
        let mut args = BTreeMap::new();
        match query {
            KrpcQuery::Ping { id } => {
                args.insert(b"id".to_vec(), Bencode::BString(id.0.to_vec()));
                (b"ping".to_vec(), args)
            }
            KrpcQuery::FindNode { id, target } => {
                args.insert(b"id".to_vec(), Bencode::BString(id.0.to_vec()));
                args.insert(b"target".to_vec(), Bencode::BString(target.0.to_vec()));
                (b"find_node".to_vec(), args)
            }
            KrpcQuery::GetPeers { id, info_hash } => {
                args.insert(b"id".to_vec(), Bencode::BString(id.0.to_vec()));
                args.insert(
                    b"info_hash".to_vec(),
                    Bencode::BString(info_hash.as_bytes().to_vec()),
                );
                (b"get_peers".to_vec(), args)
            }
            KrpcQuery::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => {
                args.insert(b"id".to_vec(), Bencode::BString(id.0.to_vec()));
                args.insert(
                    b"info_hash".to_vec(),
                    Bencode::BString(info_hash.as_bytes().to_vec()),
                );
                args.insert(b"port".to_vec(), Bencode::BNumber(*port as i64));
                args.insert(b"token".to_vec(), Bencode::BString(token.clone()));
                if *implied_port {
                    args.insert(b"implied_port".to_vec(), Bencode::BNumber(1));
                }
                (b"announce_peer".to_vec(), args)
            }
        }
    }

    fn encode_response(response: &KrpcResponse) -> BTreeMap<Vec<u8>, Bencode> {
        let mut r = BTreeMap::new();
        r.insert(b"id".to_vec(), Bencode::BString(response.id.0.to_vec()));
        if !response.nodes.is_empty() {
            r.insert(
                b"nodes".to_vec(),
                Bencode::BString(encode_compact_nodes(&response.nodes)),
            );
        }
        if !response.values.is_empty() {
            let values = response
                .values
                .iter()
                .filter_map(encode_compact_peer)
                .map(Bencode::BString)
                .collect();
            r.insert(b"values".to_vec(), Bencode::BList(values));
        }
        if let Some(token) = &response.token {
            r.insert(b"token".to_vec(), Bencode::BString(token.clone()));
        }
        r
    }

    pub fn decode(data: &[u8]) -> Result<KrpcMessage, KrpcError> {
        let bencode = Bencode::decode(data).map_err(KrpcError::MalformedBencode)?;
        if bencode.as_dict().is_none() {
            return Err(KrpcError::NotADict);
        }

        let txn = bencode
            .dict_get(b"t")
            .and_then(|v| v.as_bytes())
            .ok_or(KrpcError::MissingField("t"))?
            .to_vec();
        let y = bencode
            .dict_get(b"y")
            .and_then(|v| v.as_bytes())
            .ok_or(KrpcError::MissingField("y"))?;

        match y {
            b"q" => Self::decode_query(&bencode, txn),
            b"r" => Self::decode_response(&bencode, txn),
            b"e" => {
                let list = bencode
                    .dict_get(b"e")
                    .and_then(|v| v.as_list())
                    .ok_or(KrpcError::MissingField("e"))?;
                let code = list.first().and_then(|v| v.as_number()).unwrap_or(201);
                let message = list
                    .get(1)
                    .and_then(|v| v.as_bytes())
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .unwrap_or_default();
                Ok(KrpcMessage::Error { txn, code, message })
            }
            _ => Err(KrpcError::UnknownMessageType),
        }
    }

    fn decode_query(bencode: &Bencode, txn: Vec<u8>) -> Result<KrpcMessage, KrpcError> {
        let name = bencode
            .dict_get(b"q")
            .and_then(|v| v.as_bytes())
            .ok_or(KrpcError::MissingField("q"))?;
        let args = bencode
            .dict_get(b"a")
            .ok_or(KrpcError::MissingField("a"))?;
        let id = args
            .dict_get(b"id")
            .and_then(|v| v.as_bytes())
            .and_then(NodeId::from_slice)
            .ok_or(KrpcError::MissingField("id"))?;

        let query = match name {
            b"ping" => KrpcQuery::Ping { id },
            b"find_node" => {
                let target = args
                    .dict_get(b"target")
                    .and_then(|v| v.as_bytes())
                    .and_then(NodeId::from_slice)
                    .ok_or(KrpcError::MissingField("target"))?;
                KrpcQuery::FindNode { id, target }
            }
            b"get_peers" => {
                let info_hash = args
                    .dict_get(b"info_hash")
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| InfoHash::from_slice(b).ok())
                    .ok_or(KrpcError::MissingField("info_hash"))?;
                KrpcQuery::GetPeers { id, info_hash }
            }
            b"announce_peer" => {
                let info_hash = args
                    .dict_get(b"info_hash")
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| InfoHash::from_slice(b).ok())
                    .ok_or(KrpcError::MissingField("info_hash"))?;
                let port = args
                    .dict_get(b"port")
                    .and_then(|v| v.as_number())
                    .ok_or(KrpcError::MissingField("port"))? as u16;
                let token = args
                    .dict_get(b"token")
                    .and_then(|v| v.as_bytes())
                    .ok_or(KrpcError::MissingField("token"))?
                    .to_vec();
                let implied_port = args
                    .dict_get(b"implied_port")
                    .and_then(|v| v.as_number())
                    .unwrap_or(0)
                    != 0;
                KrpcQuery::AnnouncePeer {
                    id,
                    info_hash,
                    port,
                    token,
                    implied_port,
                }
            }
            other => {
                return Err(KrpcError::UnknownQuery(
                    String::from_utf8_lossy(other).to_string(),
                ))
            }
        };
        Ok(KrpcMessage::Query { txn, query })
    }

    fn decode_response(bencode: &Bencode, txn: Vec<u8>) -> Result<KrpcMessage, KrpcError> {
        let r = bencode
            .dict_get(b"r")
            .ok_or(KrpcError::MissingField("r"))?;
        let id = r
            .dict_get(b"id")
            .and_then(|v| v.as_bytes())
            .and_then(NodeId::from_slice)
            .ok_or(KrpcError::MissingField("id"))?;

        let nodes = r
            .dict_get(b"nodes")
            .and_then(|v| v.as_bytes())
            .map(decode_compact_nodes)
            .unwrap_or_default();
        let values = r
            .dict_get(b"values")
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(decode_compact_peer)
                    .collect()
            })
            .unwrap_or_default();
        let token = r
            .dict_get(b"token")
            .and_then(|v| v.as_bytes())
            .map(|b| b.to_vec());

        Ok(KrpcMessage::Response {
            txn,
            response: KrpcResponse {
                id,
                nodes,
                values,
                token,
            },
        })
    }
}

/// Encodes IPv4 nodes as 26-byte compact entries; other families are
/// skipped.
pub fn encode_compact_nodes(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LENGTH);
    for (id, addr) in nodes {
        if let IpAddr::V4(ip) = addr.ip() {
            out.extend(id.0);
            out.extend(ip.octets());
            out.extend(addr.port().to_be_bytes());
        }
    }
    out
}

pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    bytes
        .chunks_exact(COMPACT_NODE_LENGTH)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Some((id, SocketAddr::new(IpAddr::V4(ip), port)))
        })
        .collect()
}

pub fn encode_compact_peer(addr: &SocketAddr) -> Option<Vec<u8>> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut out = Vec::with_capacity(COMPACT_PEER_LENGTH);
            out.extend(ip.octets());
            out.extend(addr.port().to_be_bytes());
            Some(out)
        }
        IpAddr::V6(_) => None,
    }
}

pub fn decode_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != COMPACT_PEER_LENGTH {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

// ------------------------------------------------------------------------------------------------
// Transaction table

/// What an outbound query resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Response(KrpcResponse),
    Error { code: i64, message: String },
    Timeout,
}

/// One pending query's rendezvous point between the sender thread and the
/// socket pump.
pub struct PendingSlot {
    state: Mutex<Option<QueryOutcome>>,
    ready: Condvar,
}

impl PendingSlot {
    fn new() -> PendingSlot {
        PendingSlot {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn fill(&self, outcome: QueryOutcome) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(outcome);
            self.ready.notify_all();
        }
    }

    /// Non-blocking peek, for callers that poll instead of waiting.
    pub fn try_get(&self) -> Option<QueryOutcome> {
        self.state.lock().unwrap().clone()
    }

    /// Blocks until the pump fills the slot or the timeout passes.
    pub fn wait(&self, timeout: Duration) -> QueryOutcome {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while state.is_none() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return QueryOutcome::Timeout;
            }
            let (next, _) = self.ready.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        state.clone().unwrap_or(QueryOutcome::Timeout)
    }
}

struct PendingEntry {
    slot: Arc<PendingSlot>,
    registered_at: std::time::Instant,
}

/// Maps transaction IDs of in-flight queries to their waiting callers.
#[derive(Default)]
pub struct TransactionTable {
    next_txn: u16,
    pending: HashMap<Vec<u8>, PendingEntry>,
}

impl TransactionTable {
    pub fn new() -> TransactionTable {
        TransactionTable::default()
    }

    /// Registers a new in-flight query and returns its wire txn id and slot.
    pub fn register(&mut self) -> (Vec<u8>, Arc<PendingSlot>) {
        let txn = self.next_txn.to_be_bytes().to_vec();
        self.next_txn = self.next_txn.wrapping_add(1);
        let slot = Arc::new(PendingSlot::new());
        self.pending.insert(
            txn.clone(),
            PendingEntry {
                slot: slot.clone(),
                registered_at: std::time::Instant::now(),
            },
        );
        (txn, slot)
    }

    /// Routes an incoming response or error to its waiter.
    pub fn resolve(&mut self, txn: &[u8], outcome: QueryOutcome) -> bool {
        match self.pending.remove(txn) {
            Some(entry) => {
                entry.slot.fill(outcome);
                true
            }
            None => false,
        }
    }

    /// Drops a pending entry whose waiter gave up.
    pub fn forget(&mut self, txn: &[u8]) {
        self.pending.remove(txn);
    }

    /// Resolves abandoned entries (fire-and-forget pings that never came
    /// back) as timeouts.
    pub fn expire_older_than(&mut self, max_age: Duration, now: std::time::Instant) -> usize {
        let stale: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, e)| now.duration_since(e.registered_at) >= max_age)
            .map(|(txn, _)| txn.clone())
            .collect();
        for txn in &stale {
            self.resolve(txn, QueryOutcome::Timeout);
        }
        stale.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
