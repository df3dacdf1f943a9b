use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::adapters::filesystem::FileSystem;
use crate::adapters::hasher::Hasher;
use crate::adapters::socket::{Socket, SocketFactory};
use crate::common::info_hash::InfoHash;
use crate::config::cfg::Cfg;
use crate::dht::node::{DhtNode, DEFAULT_BOOTSTRAP_NODES};
use crate::dht::routing_table::NodeId;
use crate::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use crate::peer::session;
use crate::session::persistence::{
    DhtNodeData, DhtRoutingTableData, DhtStateData, SessionPersistence, TorrentListEntry,
    TorrentOrigin,
};
use crate::session::store::SessionStore;
use crate::torrent::controller::{TorrentContext, TorrentController};
use crate::torrent::metainfo::MetaInfo;
use crate::torrent::source::TorrentSource;
use crate::tracker::client::TrackerClient;

use super::events::EngineEvent;

/// The engine-wide connection cap, shared by every torrent.
///
/// A plain counter under the threading model; acquisition hands out a guard
/// that releases on drop.
pub struct ConnectionBudget {
    max: usize,
    in_use: AtomicUsize,
}

impl ConnectionBudget {
    pub fn new(max: usize) -> Arc<ConnectionBudget> {
        Arc::new(ConnectionBudget {
            max,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.in_use.load(Ordering::SeqCst))
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Claims one slot unless the cap is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetGuard> {
        let claimed = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < self.max {
                    Some(current + 1)
                } else {
                    None
                }
            });
        match claimed {
            Ok(_) => Some(BudgetGuard {
                budget: self.clone(),
            }),
            Err(_) => None,
        }
    }
}

/// Releases its budget slot when dropped.
pub struct BudgetGuard {
    budget: Arc<ConnectionBudget>,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Options for `add_torrent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddTorrentOptions {
    /// Register without starting.
    pub paused: bool,
    /// Do not write the torrent index (used during restore).
    pub skip_persist: bool,
}

/// Possible engine errors.
#[derive(Debug)]
pub enum EngineError {
    InvalidSource(String),
    Io(std::io::Error),
}

/// The entry point a host embeds: owns the torrent set, the listening
/// socket, the DHT node and the global connection budget.
pub struct Engine {
    config: Cfg,
    local_peer_id: [u8; 20],
    fs: Arc<dyn FileSystem>,
    hasher: Arc<dyn Hasher>,
    store: Arc<dyn SessionStore>,
    socket_factory: Arc<dyn SocketFactory>,
    tracker_client: Option<Arc<dyn TrackerClient>>,
    budget: Arc<ConnectionBudget>,
    torrents: Mutex<HashMap<InfoHash, Arc<TorrentController>>>,
    events_tx: Mutex<Sender<EngineEvent>>,
    events_rx: Mutex<Option<Receiver<EngineEvent>>>,
    dht: Mutex<Option<Arc<DhtNode>>>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(
        config: Cfg,
        fs: Arc<dyn FileSystem>,
        hasher: Arc<dyn Hasher>,
        store: Arc<dyn SessionStore>,
        socket_factory: Arc<dyn SocketFactory>,
        tracker_client: Option<Arc<dyn TrackerClient>>,
    ) -> Arc<Engine> {
        let (events_tx, events_rx) = channel();
        let budget = ConnectionBudget::new(config.max_connections);
        Arc::new(Engine {
            local_peer_id: generate_peer_id(),
            config,
            fs,
            hasher,
            store,
            socket_factory,
            tracker_client,
            budget,
            torrents: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
            dht: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    /// The host takes the event stream exactly once.
    pub fn take_event_receiver(&self) -> Option<Receiver<EngineEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    pub fn local_peer_id(&self) -> [u8; 20] {
        self.local_peer_id
    }

    pub fn connection_budget(&self) -> Arc<ConnectionBudget> {
        self.budget.clone()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.lock().unwrap().send(event);
    }

    fn context(&self) -> TorrentContext {
        TorrentContext {
            config: self.config.clone(),
            local_peer_id: self.local_peer_id,
            fs: self.fs.clone(),
            hasher: self.hasher.clone(),
            store: self.store.clone(),
            socket_factory: self.socket_factory.clone(),
            budget: self.budget.clone(),
            events: Mutex::new(self.events_tx.lock().unwrap().clone()),
            tracker_client: self.tracker_client.clone(),
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Torrent set

    /// Adds a torrent. If the infohash already exists, the existing torrent
    /// is returned instead.
    pub fn add_torrent(
        self: &Arc<Self>,
        source: TorrentSource,
        options: AddTorrentOptions,
    ) -> Result<Arc<TorrentController>, EngineError> {
        let info_hash = match &source {
            TorrentSource::TorrentFile(bytes) => {
                MetaInfo::from_bytes(bytes, self.hasher.as_ref())
                    .map_err(|e| EngineError::InvalidSource(format!("{:?}", e)))?
                    .info_hash
            }
            TorrentSource::Magnet(magnet) => magnet.info_hash,
        };

        if let Some(existing) = self.torrents.lock().unwrap().get(&info_hash) {
            return Ok(existing.clone());
        }

        let controller = TorrentController::new(&source, self.context())
            .map_err(|e| EngineError::InvalidSource(format!("{:?}", e)))?;
        controller.set_dht(self.dht.lock().unwrap().clone());
        self.torrents
            .lock()
            .unwrap()
            .insert(info_hash, controller.clone());

        if !options.skip_persist {
            let persistence = SessionPersistence::new(self.store.as_ref());
            let (origin, magnet_uri) = match &source {
                TorrentSource::TorrentFile(bytes) => {
                    let _ = persistence.save_torrent_file(&info_hash, bytes);
                    (TorrentOrigin::File, None)
                }
                TorrentSource::Magnet(magnet) => {
                    (TorrentOrigin::Magnet, Some(magnet.to_uri()))
                }
            };
            let entry = TorrentListEntry {
                info_hash: info_hash.to_hex(),
                source: origin,
                magnet_uri,
                added_at: chrono::Utc::now().timestamp(),
            };
            if let Err(err) = persistence.upsert_torrent_entry(entry) {
                warn!("could not persist torrent index: {:?}", err);
            }
        }

        self.emit(EngineEvent::TorrentAdded(info_hash));
        if !options.paused {
            controller.start();
        }
        Ok(controller)
    }

    /// Stops a torrent, drops its persisted state and forgets it.
    pub fn remove_torrent(&self, info_hash: &InfoHash) -> bool {
        let controller = self.torrents.lock().unwrap().remove(info_hash);
        match controller {
            Some(controller) => {
                controller.stop();
                let persistence = SessionPersistence::new(self.store.as_ref());
                if let Err(err) = persistence.remove_torrent(info_hash) {
                    warn!("could not remove persisted state: {:?}", err);
                }
                self.emit(EngineEvent::TorrentRemoved(*info_hash));
                true
            }
            None => false,
        }
    }

    pub fn get_torrent(&self, info_hash: &InfoHash) -> Option<Arc<TorrentController>> {
        self.torrents.lock().unwrap().get(info_hash).cloned()
    }

    pub fn torrents(&self) -> Vec<Arc<TorrentController>> {
        self.torrents.lock().unwrap().values().cloned().collect()
    }

    /// Rebuilds the torrent set from the session store.
    pub fn restore_torrents(self: &Arc<Self>) {
        let persistence = SessionPersistence::new(self.store.as_ref());
        for entry in persistence.load_torrent_list() {
            let info_hash = match InfoHash::from_hex(&entry.info_hash) {
                Ok(info_hash) => info_hash,
                Err(_) => continue,
            };
            let source = match entry.source {
                TorrentOrigin::File => {
                    match persistence.load_torrent_file(&info_hash).ok().flatten() {
                        Some(bytes) => TorrentSource::TorrentFile(bytes),
                        None => continue,
                    }
                }
                TorrentOrigin::Magnet => {
                    let uri = match &entry.magnet_uri {
                        Some(uri) => uri.clone(),
                        None => continue,
                    };
                    match TorrentSource::from_magnet_uri(&uri) {
                        Ok(source) => source,
                        Err(_) => continue,
                    }
                }
            };

            let persisted_state = persistence.load_state(&info_hash).ok().flatten();
            let start_paused = match &persisted_state {
                Some(state) => {
                    state.user_state == crate::session::persistence::UserState::Stopped
                }
                None => false,
            };

            let added = self.add_torrent(
                source,
                AddTorrentOptions {
                    paused: true,
                    skip_persist: true,
                },
            );
            let controller = match added {
                Ok(controller) => controller,
                Err(err) => {
                    warn!("could not restore {}: {:?}", entry.info_hash, err);
                    continue;
                }
            };

            // a vanished storage root parks the torrent instead of dropping it
            if let Some(state) = &persisted_state {
                let root = std::path::Path::new(&state.storage_key);
                if !state.storage_key.is_empty() && !self.fs.exists(root) {
                    controller.park(format!("storage root {} is missing", state.storage_key));
                    continue;
                }
            }
            if !start_paused {
                controller.start();
            }
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Server socket

    /// Binds the listening socket and accepts inbound peers on a thread.
    pub fn run_server(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let listener = self.socket_factory.listen(self.config.tcp_port)?;
        info!(
            "listening for peers on port {}",
            listener.local_port().unwrap_or(self.config.tcp_port)
        );
        let engine = self.clone();
        let builder = thread::Builder::new().name("peer-server".to_string());
        builder.spawn(move || {
            while engine.running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok(socket) => engine.handle_incoming(socket),
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        break;
                    }
                }
            }
        })
    }

    /// Reads the 68-byte handshake off an inbound socket and routes it to
    /// the owning torrent by infohash.
    pub fn handle_incoming(self: &Arc<Self>, mut socket: Box<dyn Socket>) {
        // the global cap is enforced before any bytes are read
        let guard = match self.budget.try_acquire() {
            Some(guard) => guard,
            None => {
                debug!("inbound peer rejected: connection budget exhausted");
                socket.shutdown();
                return;
            }
        };

        let timeout = Duration::from_secs(self.config.read_write_seconds_timeout);
        if socket.set_timeouts(Some(timeout)).is_err() {
            socket.shutdown();
            return;
        }
        let mut buffer = [0u8; HANDSHAKE_LENGTH];
        if socket.read_exact(&mut buffer).is_err() {
            socket.shutdown();
            return;
        }
        let handshake = match Handshake::from_bytes(&buffer) {
            Ok(handshake) => handshake,
            Err(_) => {
                debug!("inbound peer sent a malformed handshake");
                socket.shutdown();
                return;
            }
        };
        let info_hash = match InfoHash::from_slice(&handshake.info_hash) {
            Ok(info_hash) => info_hash,
            Err(_) => {
                socket.shutdown();
                return;
            }
        };

        let torrent = match self.get_torrent(&info_hash) {
            Some(torrent) => torrent,
            None => {
                debug!("inbound peer asked for unknown torrent {}", info_hash);
                socket.shutdown();
                return;
            }
        };
        if !torrent.is_running() || !torrent.may_admit_peer() {
            socket.shutdown();
            return;
        }
        session::spawn_incoming(&torrent, socket, handshake, guard);
    }

    // ------------------------------------------------------------------------------------------------
    // DHT

    /// Starts or stops the DHT node, restoring or persisting its identity.
    pub fn set_dht_enabled(self: &Arc<Self>, enabled: bool) -> std::io::Result<()> {
        if enabled {
            if self.dht.lock().unwrap().is_some() {
                return Ok(());
            }
            let persistence = SessionPersistence::new(self.store.as_ref());
            let persisted = persistence.load_dht_state().ok().flatten();
            let node_id = persisted
                .as_ref()
                .and_then(|s| NodeId::from_hex(&s.node_id))
                .unwrap_or_else(NodeId::random);

            let socket = self.socket_factory.bind_udp(self.config.dht_port)?;
            let node = DhtNode::new(node_id, socket);
            node.start()?;
            if let Some(state) = persisted {
                let entries = state
                    .routing_table
                    .nodes
                    .iter()
                    .filter_map(|n| {
                        let id = NodeId::from_hex(&n.id)?;
                        let addr = format!("{}:{}", n.host, n.port).parse().ok()?;
                        Some((id, addr))
                    })
                    .collect();
                node.restore(entries);
            }

            let bootstrap: Vec<String> = DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect();
            let bootstrap_node = node.clone();
            let _ = thread::Builder::new()
                .name("dht-bootstrap".to_string())
                .spawn(move || bootstrap_node.bootstrap(&bootstrap));

            *self.dht.lock().unwrap() = Some(node.clone());
            for torrent in self.torrents() {
                torrent.set_dht(Some(node.clone()));
            }
        } else {
            let node = self.dht.lock().unwrap().take();
            if let Some(node) = node {
                self.persist_dht_state(&node);
                node.stop();
                for torrent in self.torrents() {
                    torrent.set_dht(None);
                }
            }
        }
        Ok(())
    }

    fn persist_dht_state(&self, node: &DhtNode) {
        let state = DhtStateData {
            node_id: node.node_id().to_hex(),
            routing_table: DhtRoutingTableData {
                nodes: node
                    .snapshot()
                    .into_iter()
                    .map(|entry| DhtNodeData {
                        id: entry.id.to_hex(),
                        host: entry.addr.ip().to_string(),
                        port: entry.addr.port(),
                    })
                    .collect(),
            },
        };
        let persistence = SessionPersistence::new(self.store.as_ref());
        if let Err(err) = persistence.save_dht_state(&state) {
            warn!("could not persist dht state: {:?}", err);
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Shutdown

    /// Flushes state, stops every torrent, the DHT and the server loop.
    pub fn destroy(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        for torrent in self.torrents() {
            torrent.persist_state(if torrent.is_running() {
                crate::session::persistence::UserState::Active
            } else {
                crate::session::persistence::UserState::Stopped
            });
            torrent.stop();
        }
        let _ = self.set_dht_enabled(false);
        info!("engine shut down");
    }
}

// Azureus-style peer id: client tag plus random suffix.
fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-DE0100-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id.iter_mut().skip(8) {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    id
}
