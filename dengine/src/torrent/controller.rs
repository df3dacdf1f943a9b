use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::adapters::filesystem::FileSystem;
use crate::adapters::hasher::Hasher;
use crate::adapters::socket::SocketFactory;
use crate::bandwidth::accounting::TrafficAccounting;
use crate::bandwidth::rate_limiter::RateLimiter;
use crate::common::bitfield::Bitfield;
use crate::common::info_hash::InfoHash;
use crate::dht::node::DhtNode;
use crate::engine::events::EngineEvent;
use crate::engine::hub::ConnectionBudget;
use crate::peer::connection::{ConnectionId, PeerConnection, PeerEvent};
use crate::peer::extensions::handshake::{ExtensionHandshake, UT_METADATA};
use crate::peer::extensions::ut_metadata::{
    MetadataExchange, MetadataMessage, METADATA_CHUNK_SIZE,
};
use crate::peer::peer_message::Request;
use crate::picker::corruption::CorruptionTracker;
use crate::picker::file_priority::{classify_pieces, FilePriority, PieceClass};
use crate::picker::piece_picker::{BlockReceived, PiecePicker};
use crate::session::persistence::{SessionPersistence, TorrentStateData, UserState};
use crate::session::store::SessionStore;
use crate::storage::content_storage::ContentStorage;
use crate::storage::parts_file::PartsFile;
use crate::swarm::connection_manager::{ConnectionManager, PeerActivity};
use crate::swarm::registry::{PeerSource, Swarm};
use crate::torrent::info::Info;
use crate::torrent::metainfo::MetaInfo;
use crate::torrent::source::TorrentSource;
use crate::tracker::client::{
    AnnounceEvent, AnnounceRequest, AnnounceSchedule, TrackerClient,
};

/// Per-peer request pipeline ceiling for very fast peers.
const MAX_PIPELINE_DEPTH: usize = 500;
/// Counter drift tolerated before an invariant event fires.
const INVARIANT_HEADROOM: usize = 2;

/// Lifecycle of one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    /// No metadata yet (magnet before ut_metadata completes).
    Initializing,
    /// Verifying bytes already on disk.
    Checking,
    Active,
    Stopped,
    Complete,
    Error,
}

/// Something the controller wants a specific peer session to do on its next
/// tick.
#[derive(Debug, PartialEq)]
pub enum PeerDirective {
    Cancel(Request),
    Close(String),
}

/// Everything the engine wires into each torrent.
pub struct TorrentContext {
    pub config: crate::config::cfg::Cfg,
    pub local_peer_id: [u8; 20],
    pub fs: Arc<dyn FileSystem>,
    pub hasher: Arc<dyn Hasher>,
    pub store: Arc<dyn SessionStore>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub budget: Arc<ConnectionBudget>,
    pub events: Mutex<Sender<EngineEvent>>,
    pub tracker_client: Option<Arc<dyn TrackerClient>>,
}

// Everything that only exists once metadata is known.
struct TorrentData {
    info: Info,
    info_bytes: Vec<u8>,
    storage: ContentStorage,
    parts: PartsFile,
}

// Controller-side view of one live peer session.
struct PeerHandle {
    addr: SocketAddr,
    raw_bitfield: Option<Vec<u8>>,
    bitfield: Option<Bitfield>,
    is_seed: bool,
    connected_at: Instant,
    last_received: Option<Instant>,
    received_window: u64,
    smoothed_rate: f64,
    last_rate_sample: Instant,
    target_depth: usize,
    reached_target: bool,
}

impl PeerHandle {
    fn new(addr: SocketAddr, initial_depth: usize, now: Instant) -> PeerHandle {
        PeerHandle {
            addr,
            raw_bitfield: None,
            bitfield: None,
            is_seed: false,
            connected_at: now,
            last_received: None,
            received_window: 0,
            smoothed_rate: 0.0,
            last_rate_sample: now,
            target_depth: initial_depth.max(1),
            reached_target: false,
        }
    }

    fn sample_rate(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_rate_sample).as_secs_f64();
        if elapsed < 1.0 {
            return;
        }
        let instant_rate = self.received_window as f64 / elapsed;
        self.smoothed_rate = self.smoothed_rate * 0.7 + instant_rate * 0.3;
        self.received_window = 0;
        self.last_rate_sample = now;
    }
}

/// The per-torrent orchestrator: owns the swarm, the piece picker and the
/// content storage, and coordinates every peer session of the torrent.
pub struct TorrentController {
    info_hash: InfoHash,
    display_name: Mutex<Option<String>>,
    context: TorrentContext,
    storage_root: PathBuf,
    state: Mutex<TorrentState>,
    error_message: Mutex<Option<String>>,
    data: Mutex<Option<TorrentData>>,
    picker: Mutex<Option<PiecePicker>>,
    priorities: Mutex<Vec<FilePriority>>,
    swarm: Mutex<Swarm>,
    connection_manager: ConnectionManager,
    corruption: Mutex<CorruptionTracker>,
    trackers: Mutex<Vec<AnnounceSchedule>>,
    metadata_exchange: Mutex<Option<MetadataExchange>>,
    metadata_initialized: AtomicBool,
    handles: Mutex<HashMap<ConnectionId, PeerHandle>>,
    directives: Mutex<HashMap<ConnectionId, Vec<PeerDirective>>>,
    running: AtomicBool,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    next_connection_id: AtomicU64,
    pub rate: Arc<RateLimiter>,
    pub traffic: Arc<TrafficAccounting>,
    dht: Mutex<Option<Arc<DhtNode>>>,
    last_dht_announce: Mutex<Option<Instant>>,
}

/// Possible controller errors surfaced to the engine.
#[derive(Debug)]
pub enum TorrentControllerError {
    MalformedTorrent(String),
    NoMetadata,
    Storage(String),
}

impl TorrentController {
    /// Builds a controller from a source. A `.torrent` source initializes
    /// metadata immediately; a magnet stays `Initializing` until ut_metadata
    /// completes. The storage root binds to the torrent identity here, at
    /// add time.
    pub fn new(
        source: &TorrentSource,
        context: TorrentContext,
    ) -> Result<Arc<TorrentController>, TorrentControllerError> {
        let (info_hash, display_name, trackers, meta) = match source {
            TorrentSource::TorrentFile(bytes) => {
                let meta = MetaInfo::from_bytes(bytes, context.hasher.as_ref())
                    .map_err(|e| TorrentControllerError::MalformedTorrent(format!("{:?}", e)))?;
                (
                    meta.info_hash,
                    Some(meta.info.name.clone()),
                    meta.all_trackers(),
                    Some(meta),
                )
            }
            TorrentSource::Magnet(magnet) => (
                magnet.info_hash,
                magnet.display_name.clone(),
                magnet.trackers.clone(),
                None,
            ),
        };

        let storage_root = PathBuf::from(&context.config.download_directory);
        let connection_manager = ConnectionManager::new(
            Duration::from_secs(context.config.maintenance_min_seconds),
            Duration::from_secs(context.config.maintenance_base_seconds),
            Duration::from_secs(context.config.maintenance_max_seconds),
        );
        let rate = Arc::new(RateLimiter::new(
            context.config.download_rate_kbps * 1024,
            context.config.upload_rate_kbps * 1024,
        ));

        let controller = Arc::new(TorrentController {
            info_hash,
            display_name: Mutex::new(display_name),
            context,
            storage_root,
            state: Mutex::new(TorrentState::Initializing),
            error_message: Mutex::new(None),
            data: Mutex::new(None),
            picker: Mutex::new(None),
            priorities: Mutex::new(Vec::new()),
            swarm: Mutex::new(Swarm::new()),
            connection_manager,
            corruption: Mutex::new(CorruptionTracker::with_defaults()),
            trackers: Mutex::new(trackers.into_iter().map(AnnounceSchedule::new).collect()),
            metadata_exchange: Mutex::new(None),
            metadata_initialized: AtomicBool::new(false),
            handles: Mutex::new(HashMap::new()),
            directives: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
            rate,
            traffic: Arc::new(TrafficAccounting::new()),
            dht: Mutex::new(None),
            last_dht_announce: Mutex::new(None),
        });

        if let Some(meta) = meta {
            controller.initialize_metadata(&meta.info_bytes)?;
        }
        Ok(controller)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> String {
        self.display_name
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.info_hash.to_hex())
    }

    pub fn state(&self) -> TorrentState {
        *self.state.lock().unwrap()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_peer_id(&self) -> [u8; 20] {
        self.context.local_peer_id
    }

    pub fn config(&self) -> &crate::config::cfg::Cfg {
        &self.context.config
    }

    pub fn set_dht(&self, dht: Option<Arc<DhtNode>>) {
        *self.dht.lock().unwrap() = dht;
    }

    pub fn budget(&self) -> Arc<ConnectionBudget> {
        self.context.budget.clone()
    }

    pub fn socket_factory(&self) -> Arc<dyn SocketFactory> {
        self.context.socket_factory.clone()
    }

    /// An outbound dial never produced a session.
    pub fn connect_failed(&self, addr: &SocketAddr) {
        self.swarm.lock().unwrap().mark_failed(addr);
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: EngineEvent) {
        // a dropped receiver only means the host stopped listening
        let _ = self.context.events.lock().unwrap().send(event);
    }

    // ------------------------------------------------------------------------------------------------
    // Lifecycle

    /// Starts the torrent: maintenance loop, tracker and DHT discovery.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            *state = match *state {
                TorrentState::Error => TorrentState::Error,
                TorrentState::Complete => TorrentState::Complete,
                _ if self.metadata_initialized.load(Ordering::SeqCst) => TorrentState::Active,
                _ => TorrentState::Initializing,
            };
        }
        if self.state() == TorrentState::Error {
            self.running.store(false, Ordering::SeqCst);
            return;
        }
        info!("torrent {} started", self.name());

        let controller = self.clone();
        let builder =
            std::thread::Builder::new().name(format!("maintenance {}", self.info_hash));
        let spawned = builder.spawn(move || controller.maintenance_loop());
        if let Err(err) = spawned {
            warn!("could not spawn maintenance thread: {}", err);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Stops the torrent but keeps its progress. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state == TorrentState::Active || *state == TorrentState::Initializing {
                *state = TorrentState::Stopped;
            }
        }
        self.persist_state(UserState::Stopped);
        info!("torrent {} stopped", self.name());
    }

    /// Parks the torrent with a user-visible error (a missing storage root
    /// on restore) without removing it from the engine.
    pub fn park(&self, message: String) {
        self.set_error(message);
    }

    fn set_error(&self, message: String) {
        warn!("torrent {} failed: {}", self.name(), message);
        *self.error_message.lock().unwrap() = Some(message.clone());
        *self.state.lock().unwrap() = TorrentState::Error;
        self.running.store(false, Ordering::SeqCst);
        self.emit(EngineEvent::TorrentError {
            info_hash: self.info_hash,
            message,
        });
    }

    // ------------------------------------------------------------------------------------------------
    // Metadata

    /// Wires up picker and storage from a verified info dict. Guarded so the
    /// ut_metadata path and the constructor path cannot both run it.
    pub fn initialize_metadata(
        &self,
        info_bytes: &[u8],
    ) -> Result<(), TorrentControllerError> {
        if self.metadata_initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let bencode = bencoder::bencode::Bencode::decode(info_bytes).map_err(|e| {
            self.metadata_initialized.store(false, Ordering::SeqCst);
            TorrentControllerError::MalformedTorrent(format!("{:?}", e))
        })?;
        let info = Info::from(&bencode).map_err(|e| {
            self.metadata_initialized.store(false, Ordering::SeqCst);
            TorrentControllerError::MalformedTorrent(format!("{:?}", e))
        })?;

        *self.display_name.lock().unwrap() = Some(info.name.clone());

        let persistence = SessionPersistence::new(self.context.store.as_ref());
        let persisted = persistence.load_state(&self.info_hash).ok().flatten();

        let mut priorities = vec![FilePriority::Normal; info.files.len()];
        if let Some(state) = &persisted {
            for (index, priority) in &state.file_priorities {
                if let Some(slot) = priorities.get_mut(*index as usize) {
                    *slot = if priority == "skip" {
                        FilePriority::Skip
                    } else {
                        FilePriority::Normal
                    };
                }
            }
        }
        let classes = classify_pieces(&info, &priorities);

        let storage =
            ContentStorage::new(&self.storage_root, &info, self.context.fs.clone());
        let parts = PartsFile::load(
            &self.storage_root,
            &self.info_hash,
            self.context.fs.clone(),
        );

        let mut picker = PiecePicker::new(info.piece_length, info.total_length, classes);
        for piece in 0..picker.piece_count() {
            if parts.contains(piece) {
                picker.set_in_parts(piece, true);
                picker.mark_have(piece);
            }
        }
        if let Some(state) = &persisted {
            if let Ok(have) =
                Bitfield::from_hex(&state.bitfield_hex, picker.piece_count() as usize)
            {
                for piece in 0..picker.piece_count() {
                    if have.get(piece as usize) {
                        picker.mark_have(piece);
                    }
                }
            }
            self.uploaded.store(state.uploaded, Ordering::Relaxed);
            self.downloaded.store(state.downloaded, Ordering::Relaxed);
        }

        let complete = picker.is_complete();
        *self.priorities.lock().unwrap() = priorities;
        *self.picker.lock().unwrap() = Some(picker);
        *self.data.lock().unwrap() = Some(TorrentData {
            info,
            info_bytes: info_bytes.to_vec(),
            storage,
            parts,
        });
        let _ = persistence.save_info_dict(&self.info_hash, info_bytes);

        // bitfields that arrived before the metadata can be applied now
        {
            let mut handles = self.handles.lock().unwrap();
            let mut picker_guard = self.picker.lock().unwrap();
            if let Some(picker) = picker_guard.as_mut() {
                for handle in handles.values_mut() {
                    if let Some(raw) = handle.raw_bitfield.take() {
                        if let Ok(bitfield) =
                            Bitfield::from_bytes(&raw, picker.piece_count() as usize)
                        {
                            picker.add_bitfield(&bitfield);
                            handle.is_seed = bitfield.is_complete();
                            handle.bitfield = Some(bitfield);
                        }
                    }
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            *state = if complete {
                TorrentState::Complete
            } else if self.running.load(Ordering::SeqCst) {
                TorrentState::Active
            } else {
                TorrentState::Stopped
            };
        }
        *self.metadata_exchange.lock().unwrap() = None;
        self.emit(EngineEvent::TorrentReady(self.info_hash));
        Ok(())
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata_initialized.load(Ordering::SeqCst)
    }

    pub fn metadata_size(&self) -> Option<i64> {
        self.data
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.info_bytes.len() as i64)
    }

    // ------------------------------------------------------------------------------------------------
    // File priorities

    /// Sets one file's priority. Returns how many files changed.
    pub fn set_file_priority(
        &self,
        file_index: usize,
        priority: FilePriority,
    ) -> Result<usize, TorrentControllerError> {
        let mut map = HashMap::new();
        map.insert(file_index, priority);
        self.set_file_priorities(&map)
    }

    /// Applies a batch of priorities, reclassifying pieces once.
    pub fn set_file_priorities(
        &self,
        changes: &HashMap<usize, FilePriority>,
    ) -> Result<usize, TorrentControllerError> {
        let data = self.data.lock().unwrap();
        let data = data.as_ref().ok_or(TorrentControllerError::NoMetadata)?;

        let mut priorities = self.priorities.lock().unwrap();
        let mut changed = 0;
        for (index, priority) in changes {
            match priorities.get_mut(*index) {
                Some(slot) if *slot != *priority => {
                    *slot = *priority;
                    changed += 1;
                }
                _ => {}
            }
        }
        if changed > 0 {
            let classes = classify_pieces(&data.info, &priorities);
            if let Some(picker) = self.picker.lock().unwrap().as_mut() {
                picker.set_classes(classes);
            }
            self.persist_state(self.user_state());
        }
        Ok(changed)
    }

    pub fn file_priorities(&self) -> Vec<FilePriority> {
        self.priorities.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------------------------------------
    // Progress and recheck

    /// Bitfield advertised on the wire: owned pieces minus `.parts` pieces
    /// we cannot serve whole.
    pub fn advertised_bitfield(&self) -> Option<Bitfield> {
        let picker = self.picker.lock().unwrap();
        let picker = picker.as_ref()?;
        picker
            .have_bitfield()
            .and_not(picker.parts_mask())
            .ok()
    }

    pub fn have_bitfield(&self) -> Option<Bitfield> {
        self.picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.have_bitfield().clone())
    }

    pub fn can_serve_piece(&self, piece: u32) -> bool {
        let picker = self.picker.lock().unwrap();
        match picker.as_ref() {
            Some(picker) => {
                picker.have_bitfield().get(piece as usize)
                    && !picker.parts_mask().get(piece as usize)
            }
            None => false,
        }
    }

    pub fn completed_pieces(&self) -> usize {
        self.picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.have_count())
            .unwrap_or(0)
    }

    pub fn total_pieces(&self) -> usize {
        self.picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.piece_count() as usize)
            .unwrap_or(0)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn connected_peer_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Outstanding block requests across all peers.
    pub fn outstanding_requests(&self) -> usize {
        self.picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.outstanding_block_count())
            .unwrap_or(0)
    }

    /// Outstanding block requests to one peer.
    pub fn requests_pending_for(&self, id: ConnectionId) -> usize {
        self.picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.requests_pending(id))
            .unwrap_or(0)
    }

    pub fn is_peer_banned(&self, addr: &SocketAddr) -> bool {
        self.swarm.lock().unwrap().is_banned(addr)
    }

    /// Re-hashes everything on disk and rebuilds the owned set.
    pub fn recheck_data(&self) -> Result<(), TorrentControllerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == TorrentState::Error {
                return Ok(());
            }
            *state = TorrentState::Checking;
        }

        let data = self.data.lock().unwrap();
        let data = data.as_ref().ok_or(TorrentControllerError::NoMetadata)?;
        let piece_count = data.info.total_pieces();

        let mut have = Bitfield::new(piece_count as usize);
        for piece in 0..piece_count {
            let size = data.info.piece_size(piece) as usize;
            let bytes = if let Some(part) = data.parts.get(piece) {
                part.to_vec()
            } else {
                match data.storage.read(piece, 0, size) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            };
            let hash = self.context.hasher.sha1(&bytes);
            if Some(&hash[..]) == data.info.piece_hash(piece) {
                have.set(piece as usize, true);
            }
        }

        let complete = have.is_complete();
        if let Some(picker) = self.picker.lock().unwrap().as_mut() {
            picker.set_have_bitfield(have);
        }
        {
            let mut state = self.state.lock().unwrap();
            *state = if complete {
                TorrentState::Complete
            } else if self.running.load(Ordering::SeqCst) {
                TorrentState::Active
            } else {
                TorrentState::Stopped
            };
        }
        self.persist_state(self.user_state());
        Ok(())
    }

    fn user_state(&self) -> UserState {
        if self.running.load(Ordering::SeqCst) {
            UserState::Active
        } else {
            UserState::Stopped
        }
    }

    /// Writes the torrent's runtime state record to the session store.
    pub fn persist_state(&self, user_state: UserState) {
        let bitfield_hex = self
            .have_bitfield()
            .map(|b| b.to_hex())
            .unwrap_or_default();
        let file_priorities = self
            .priorities
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == FilePriority::Skip)
            .map(|(i, _)| (i as u32, "skip".to_string()))
            .collect();
        let state = TorrentStateData {
            user_state,
            storage_key: self.storage_root.to_string_lossy().to_string(),
            queue_position: 0,
            bitfield_hex,
            uploaded: self.uploaded(),
            downloaded: self.downloaded(),
            file_priorities,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let persistence = SessionPersistence::new(self.context.store.as_ref());
        if let Err(err) = persistence.save_state(&self.info_hash, &state) {
            warn!("could not persist torrent state: {:?}", err);
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Swarm and admission

    /// Registers a discovered endpoint.
    pub fn add_peer(&self, addr: SocketAddr, source: PeerSource) {
        self.swarm.lock().unwrap().add_peer(addr, source);
    }

    /// Registers an endpoint as a manual addition and dials it right away,
    /// subject to the usual admission caps.
    pub fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) {
        self.add_peer(addr, PeerSource::Manual);
        if !self.may_admit_peer() || self.swarm.lock().unwrap().is_banned(&addr) {
            return;
        }
        self.swarm.lock().unwrap().mark_connecting(&addr, Instant::now());
        crate::peer::session::spawn_outbound(self, addr);
    }

    /// Whether another connection may be admitted right now, counting both
    /// the per-torrent cap and the engine budget.
    pub fn may_admit_peer(&self) -> bool {
        let swarm = self.swarm.lock().unwrap();
        let in_use = swarm.connected_count() + swarm.connecting_count();
        in_use < self.context.config.max_peers_per_torrent
            && self.context.budget.available() > 0
    }

    pub fn swarm_known_peers(&self) -> usize {
        self.swarm.lock().unwrap().known_count()
    }

    /// Connected endpoints, for PEX gossip. Only peers we have actually
    /// connected to are advertised.
    pub fn pex_snapshot(&self, exclude: &SocketAddr) -> Vec<SocketAddr> {
        self.swarm
            .lock()
            .unwrap()
            .connected_addrs()
            .into_iter()
            .filter(|a| a != exclude)
            .collect()
    }

    // ------------------------------------------------------------------------------------------------
    // Session attach/detach

    /// Registers a session that completed its handshake.
    ///
    /// Re-checks self-connection here: an inbound peer id can arrive before
    /// the torrent attaches. Returns false when the session must close.
    pub fn attach_session(
        &self,
        connection: &PeerConnection,
        addr: SocketAddr,
    ) -> bool {
        if connection.is_self_connection() {
            let mut swarm = self.swarm.lock().unwrap();
            swarm.add_peer(addr, PeerSource::Incoming);
            swarm.ban(&addr);
            debug!("dropping self-connection via {}", addr);
            return false;
        }
        if self.swarm.lock().unwrap().is_banned(&addr) {
            return false;
        }

        let now = Instant::now();
        {
            let mut swarm = self.swarm.lock().unwrap();
            swarm.add_peer(addr, PeerSource::Incoming);
            swarm.mark_connected(&addr, now);
        }
        self.handles.lock().unwrap().insert(
            connection.id(),
            PeerHandle::new(
                addr,
                self.context.config.pipelining_size as usize,
                now,
            ),
        );
        true
    }

    /// Removes a finished session and releases everything it held.
    pub fn detach_session(&self, id: ConnectionId, addr: &SocketAddr, failed: bool) {
        let handle = self.handles.lock().unwrap().remove(&id);
        if let Some(handle) = &handle {
            if let Some(picker) = self.picker.lock().unwrap().as_mut() {
                picker.peer_disconnected(id);
                if handle.is_seed {
                    picker.remove_seed();
                } else if let Some(bitfield) = &handle.bitfield {
                    picker.remove_bitfield(bitfield);
                }
            }
        }
        self.directives.lock().unwrap().remove(&id);
        {
            let mut swarm = self.swarm.lock().unwrap();
            if failed {
                swarm.mark_failed(addr);
            } else {
                swarm.mark_disconnected(addr);
            }
        }
    }

    /// Queues a directive for a peer session to pick up on its next tick.
    fn push_directive(&self, id: ConnectionId, directive: PeerDirective) {
        self.directives
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(directive);
    }

    /// Drains the directives addressed to one session.
    pub fn take_directives(&self, id: ConnectionId) -> Vec<PeerDirective> {
        self.directives
            .lock()
            .unwrap()
            .get_mut(&id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------------------------------
    // Peer event handling

    /// Dispatches the events a session's socket read produced.
    pub fn handle_peer_events(
        &self,
        connection: &mut PeerConnection,
        addr: &SocketAddr,
        events: Vec<PeerEvent>,
    ) {
        for event in events {
            match event {
                PeerEvent::HandshakeCompleted { .. } => {
                    // outbound handshakes complete here; inbound ones were
                    // consumed by the server before attach
                    if connection.supports_extensions() {
                        let handshake = ExtensionHandshake::local(
                            self.context.config.tcp_port,
                            self.metadata_size(),
                        );
                        connection.queue_extension_handshake(&handshake);
                    }
                    if let Some(advertised) = self.advertised_bitfield() {
                        if !advertised.is_empty() {
                            connection.queue_bitfield(advertised.as_bytes().to_vec());
                        }
                    }
                }
                PeerEvent::ExtensionHandshakeReceived => {
                    self.on_extension_handshake(connection);
                }
                PeerEvent::KeepAlive => {}
                PeerEvent::Choked => {
                    if let Some(picker) = self.picker.lock().unwrap().as_mut() {
                        picker.clear_requests_for_peer(connection.id());
                    }
                }
                PeerEvent::Unchoked => {
                    self.fill_pipeline(connection);
                }
                PeerEvent::Interested => {
                    // serve anyone interested while we can
                    connection.set_am_choking(false);
                }
                PeerEvent::NotInterested => {
                    connection.set_am_choking(true);
                }
                PeerEvent::Have(piece) => self.on_have(connection, piece),
                PeerEvent::BitfieldReceived(raw) => self.on_bitfield(connection, raw),
                PeerEvent::BlockReceived { piece, begin, data } => {
                    self.on_block(connection, addr, piece, begin, data);
                }
                PeerEvent::RequestReceived {
                    piece,
                    begin,
                    length,
                } => self.on_request(connection, addr, piece, begin, length),
                PeerEvent::CancelReceived { .. } => {}
                PeerEvent::PortReceived(port) => {
                    if let Some(dht) = self.dht.lock().unwrap().as_ref() {
                        dht.ping_node(SocketAddr::new(addr.ip(), port));
                    }
                }
                PeerEvent::MetadataReceived(message) => {
                    self.on_metadata_message(connection, message);
                }
                PeerEvent::PexReceived(pex) => {
                    let mut swarm = self.swarm.lock().unwrap();
                    for peer in pex.added {
                        swarm.add_peer(peer, PeerSource::Pex);
                    }
                }
                PeerEvent::ProtocolViolation(reason) => {
                    debug!("peer {} violated protocol: {}", addr, reason);
                }
            }
        }
        self.update_interest(connection);
    }

    fn on_extension_handshake(&self, connection: &mut PeerConnection) {
        if self.has_metadata() {
            return;
        }
        if let Some(size) = connection.remote_metadata_size() {
            if size > 0 && size < 16 * 1024 * 1024 {
                let mut exchange = self.metadata_exchange.lock().unwrap();
                if exchange.is_none() {
                    *exchange = Some(MetadataExchange::new(size as usize));
                }
            }
        }
    }

    fn on_have(&self, connection: &mut PeerConnection, piece: u32) {
        let mut handles = self.handles.lock().unwrap();
        let handle = match handles.get_mut(&connection.id()) {
            Some(handle) => handle,
            None => return,
        };
        let mut picker = self.picker.lock().unwrap();
        if let Some(picker) = picker.as_mut() {
            if handle.bitfield.is_none() {
                handle.bitfield = Some(Bitfield::new(picker.piece_count() as usize));
            }
            if let Some(bitfield) = handle.bitfield.as_mut() {
                if !bitfield.get(piece as usize) && !handle.is_seed {
                    bitfield.set(piece as usize, true);
                    picker.add_have(piece);
                    // the HAVE that completed the set moves this peer's whole
                    // per-piece contribution into the seed counter
                    if bitfield.is_complete() {
                        picker.promote_to_seed(bitfield);
                        handle.is_seed = true;
                    }
                }
            }
        }
    }

    fn on_bitfield(&self, connection: &mut PeerConnection, raw: Vec<u8>) {
        let piece_count = self
            .picker
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.piece_count() as usize);

        match piece_count {
            Some(piece_count) => match Bitfield::from_bytes(&raw, piece_count) {
                Ok(bitfield) => {
                    if let Some(picker) = self.picker.lock().unwrap().as_mut() {
                        picker.add_bitfield(&bitfield);
                    }
                    let mut handles = self.handles.lock().unwrap();
                    if let Some(handle) = handles.get_mut(&connection.id()) {
                        handle.is_seed = bitfield.is_complete();
                        handle.bitfield = Some(bitfield);
                    }
                }
                Err(_) => self.push_directive(
                    connection.id(),
                    PeerDirective::Close("bitfield length mismatch".to_string()),
                ),
            },
            None => {
                // metadata still unknown; keep the raw bytes for later
                let mut handles = self.handles.lock().unwrap();
                if let Some(handle) = handles.get_mut(&connection.id()) {
                    handle.raw_bitfield = Some(raw);
                }
            }
        }
    }

    fn on_block(
        &self,
        connection: &mut PeerConnection,
        addr: &SocketAddr,
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    ) {
        let now = Instant::now();
        self.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.rate.download.try_consume(data.len() as u64);
        {
            let mut handles = self.handles.lock().unwrap();
            if let Some(handle) = handles.get_mut(&connection.id()) {
                handle.last_received = Some(now);
                handle.received_window += data.len() as u64;
            }
        }
        self.swarm
            .lock()
            .unwrap()
            .record_downloaded(addr, data.len() as u64);

        let received = {
            let mut picker = self.picker.lock().unwrap();
            match picker.as_mut() {
                Some(picker) => {
                    picker.on_block_received(connection.id(), piece, begin, &data, now)
                }
                None => return,
            }
        };

        let cancel = match &received {
            BlockReceived::Progress { cancel } => cancel.clone(),
            BlockReceived::PieceComplete { cancel } => cancel.clone(),
            BlockReceived::Ignored => None,
        };
        if let Some(order) = cancel {
            self.push_directive(
                order.peer,
                PeerDirective::Cancel(Request::new(order.piece, order.begin, order.length)),
            );
        }

        if matches!(received, BlockReceived::PieceComplete { .. }) {
            self.complete_piece(piece);
        }
        self.fill_pipeline(connection);
    }

    /// Hashes a fully received piece and either commits or requeues it.
    fn complete_piece(&self, piece: u32) {
        let active = match self.picker.lock().unwrap().as_mut() {
            Some(picker) => picker.take_pending(piece),
            None => None,
        };
        let active = match active {
            Some(active) => active,
            None => return,
        };

        let contributors = active.contributors();
        let hash = self.context.hasher.sha1(active.buffer());
        let matches = {
            let data = self.data.lock().unwrap();
            match data.as_ref() {
                Some(data) => data.info.piece_hash(piece) == Some(&hash[..]),
                None => false,
            }
        };

        if !matches {
            self.on_piece_hash_failure(piece, contributors, active.into_buffer());
            return;
        }

        let buffer = active.into_buffer();
        if let Err(err) = self.commit_piece(piece, &buffer) {
            self.set_error(format!("piece {} write failed: {:?}", piece, err));
            return;
        }

        let complete = {
            let mut picker = self.picker.lock().unwrap();
            match picker.as_mut() {
                Some(picker) => {
                    picker.mark_have(piece);
                    picker.release_buffer(buffer);
                    picker.is_complete()
                }
                None => false,
            }
        };

        self.emit(EngineEvent::PieceCompleted {
            info_hash: self.info_hash,
            piece,
        });
        self.persist_state(self.user_state());

        if complete {
            *self.state.lock().unwrap() = TorrentState::Complete;
            info!("torrent {} complete", self.name());
            self.emit(EngineEvent::TorrentComplete(self.info_hash));
        }
    }

    /// Writes a verified piece: wholly for wanted pieces, split between the
    /// content files and the parts sidecar for boundary pieces.
    fn commit_piece(&self, piece: u32, buffer: &[u8]) -> Result<(), TorrentControllerError> {
        let mut data = self.data.lock().unwrap();
        let data = data.as_mut().ok_or(TorrentControllerError::NoMetadata)?;
        let priorities = self.priorities.lock().unwrap().clone();
        let classes = classify_pieces(&data.info, &priorities);

        match classes.get(piece as usize) {
            Some(PieceClass::Boundary) => {
                // wanted file ranges go to content files, the full bytes to
                // the sidecar so the piece stays reconstructible
                let piece_start = piece as u64 * data.info.piece_length as u64;
                let piece_end = piece_start + buffer.len() as u64;
                for (index, file) in data.info.files.iter().enumerate() {
                    if priorities.get(index) != Some(&FilePriority::Normal) {
                        continue;
                    }
                    let overlap_start = piece_start.max(file.offset);
                    let overlap_end = piece_end.min(file.offset + file.length);
                    if overlap_start >= overlap_end {
                        continue;
                    }
                    let begin = (overlap_start - piece_start) as u32;
                    let slice =
                        &buffer[begin as usize..(overlap_end - piece_start) as usize];
                    data.storage
                        .write(piece, begin, slice)
                        .map_err(|e| TorrentControllerError::Storage(format!("{:?}", e)))?;
                }
                data.parts
                    .insert(piece, buffer.to_vec())
                    .map_err(|e| TorrentControllerError::Storage(e.to_string()))?;
                if let Some(picker) = self.picker.lock().unwrap().as_mut() {
                    picker.set_in_parts(piece, true);
                }
                Ok(())
            }
            _ => data
                .storage
                .write(piece, 0, buffer)
                .map_err(|e| TorrentControllerError::Storage(format!("{:?}", e))),
        }
    }

    fn on_piece_hash_failure(
        &self,
        piece: u32,
        contributors: Vec<ConnectionId>,
        buffer: Vec<u8>,
    ) {
        warn!("piece {} of {} failed its hash", piece, self.name());
        if let Some(picker) = self.picker.lock().unwrap().as_mut() {
            picker.release_buffer(buffer);
        }

        let addrs: Vec<SocketAddr> = {
            let handles = self.handles.lock().unwrap();
            contributors
                .iter()
                .filter_map(|id| handles.get(id).map(|h| h.addr))
                .collect()
        };
        let health = {
            let swarm = self.swarm.lock().unwrap();
            swarm.connected_count() as f64
                / self.context.config.max_peers_per_torrent.max(1) as f64
        };
        let decisions = self.corruption.lock().unwrap().record_failure(
            addrs,
            health,
            Instant::now(),
        );

        for decision in decisions {
            warn!(
                "banning {} ({}, confidence {:.2})",
                decision.peer, decision.reason, decision.confidence
            );
            self.swarm.lock().unwrap().ban(&decision.peer);
            let target: Option<ConnectionId> = {
                let handles = self.handles.lock().unwrap();
                handles
                    .iter()
                    .find(|(_, h)| h.addr == decision.peer)
                    .map(|(id, _)| *id)
            };
            if let Some(id) = target {
                self.push_directive(
                    id,
                    PeerDirective::Close(format!("banned: {}", decision.reason)),
                );
            }
        }
    }

    fn on_request(
        &self,
        connection: &mut PeerConnection,
        addr: &SocketAddr,
        piece: u32,
        begin: u32,
        length: u32,
    ) {
        if connection.am_choking || length > 2 * crate::picker::active_piece::BLOCK_SIZE {
            return;
        }
        if !self.can_serve_piece(piece) {
            return;
        }
        let block = {
            let data = self.data.lock().unwrap();
            match data.as_ref() {
                Some(data) => data.storage.read(piece, begin, length as usize).ok(),
                None => None,
            }
        };
        if let Some(block) = block {
            self.uploaded.fetch_add(block.len() as u64, Ordering::Relaxed);
            self.swarm
                .lock()
                .unwrap()
                .record_uploaded(addr, block.len() as u64);
            connection.queue_piece(piece, begin, &block);
        }
    }

    fn on_metadata_message(&self, connection: &mut PeerConnection, message: MetadataMessage) {
        match message {
            MetadataMessage::Request { piece } => {
                let reply = {
                    let data = self.data.lock().unwrap();
                    match data.as_ref() {
                        Some(data) => {
                            let start = piece as usize * METADATA_CHUNK_SIZE;
                            if start < data.info_bytes.len() {
                                let end =
                                    (start + METADATA_CHUNK_SIZE).min(data.info_bytes.len());
                                MetadataMessage::Data {
                                    piece,
                                    total_size: data.info_bytes.len() as i64,
                                    payload: data.info_bytes[start..end].to_vec(),
                                }
                            } else {
                                MetadataMessage::Reject { piece }
                            }
                        }
                        None => MetadataMessage::Reject { piece },
                    }
                };
                connection.queue_metadata_message(&reply);
            }
            MetadataMessage::Data { piece, payload, .. } => {
                let assembled = {
                    let mut exchange = self.metadata_exchange.lock().unwrap();
                    match exchange.as_mut() {
                        Some(exchange) => {
                            if exchange.store(piece, payload) {
                                Some(exchange.assemble())
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                if let Some(info_bytes) = assembled {
                    self.on_metadata_assembled(info_bytes);
                }
            }
            MetadataMessage::Reject { .. } => {}
        }
    }

    fn on_metadata_assembled(&self, info_bytes: Vec<u8>) {
        let hash = InfoHash::new(self.context.hasher.sha1(&info_bytes));
        if hash != self.info_hash {
            warn!(
                "assembled metadata for {} hashed to {}, restarting",
                self.info_hash, hash
            );
            if let Some(exchange) = self.metadata_exchange.lock().unwrap().as_mut() {
                exchange.restart_after_mismatch(Instant::now());
            }
            return;
        }
        self.emit(EngineEvent::MetadataResolved {
            info_hash: self.info_hash,
            info_bytes: info_bytes.clone(),
        });
        if let Err(err) = self.initialize_metadata(&info_bytes) {
            self.set_error(format!("metadata rejected: {:?}", err));
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Driving a session (called from its tick)

    /// Per-tick work for one peer: directives, interest, pipeline fill,
    /// metadata chunk requests, HAVE diffs.
    pub fn drive_peer(
        &self,
        connection: &mut PeerConnection,
        advertised: &mut Option<Bitfield>,
    ) {
        for directive in self.take_directives(connection.id()) {
            match directive {
                PeerDirective::Cancel(request) => connection.queue_cancel(request),
                PeerDirective::Close(reason) => {
                    debug!("closing peer: {}", reason);
                    connection.close();
                    return;
                }
            }
        }

        self.update_interest(connection);
        if !connection.peer_choking && connection.am_interested {
            self.fill_pipeline(connection);
        }
        self.request_metadata_chunks(connection);
        self.send_have_diff(connection, advertised);

        let now = Instant::now();
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get_mut(&connection.id()) {
            handle.sample_rate(now);
        }
    }

    fn update_interest(&self, connection: &mut PeerConnection) {
        let interesting = {
            let handles = self.handles.lock().unwrap();
            let handle = match handles.get(&connection.id()) {
                Some(handle) => handle,
                None => return,
            };
            let picker = self.picker.lock().unwrap();
            match picker.as_ref() {
                Some(picker) => match (&handle.bitfield, handle.is_seed) {
                    (_, true) => picker.is_interesting(picker.have_bitfield(), true),
                    (Some(bitfield), _) => picker.is_interesting(bitfield, false),
                    (None, _) => false,
                },
                // before metadata, any extension peer is worth keeping
                None => connection.supports_extensions(),
            }
        };
        connection.set_am_interested(interesting);
    }

    fn fill_pipeline(&self, connection: &mut PeerConnection) {
        if connection.peer_choking || !connection.am_interested {
            return;
        }
        let id = connection.id();
        let now = Instant::now();

        // never hand new requests to a peer slated for closing
        let addr = self.handles.lock().unwrap().get(&id).map(|h| h.addr);
        match addr {
            Some(addr) if self.is_peer_banned(&addr) => return,
            Some(_) => {}
            None => return,
        }
        let connected = self.swarm.lock().unwrap().connected_count();

        let mut handles = self.handles.lock().unwrap();
        let handle = match handles.get_mut(&id) {
            Some(handle) => handle,
            None => return,
        };
        let mut picker = self.picker.lock().unwrap();
        let picker = match picker.as_mut() {
            Some(picker) => picker,
            None => return,
        };

        let pending = picker.requests_pending(id);
        // a drained pipeline that was previously full means the peer keeps
        // up: deepen it
        if pending == 0 && handle.reached_target {
            handle.target_depth = (handle.target_depth * 2).min(MAX_PIPELINE_DEPTH);
            handle.reached_target = false;
        }
        if pending >= handle.target_depth {
            return;
        }

        let want = handle.target_depth - pending;
        let empty = Bitfield::new(picker.piece_count() as usize);
        let peer_has = handle.bitfield.as_ref().unwrap_or(&empty);
        let requests =
            picker.next_requests(id, peer_has, handle.is_seed, want, connected.max(1), now);
        if picker.requests_pending(id) >= handle.target_depth {
            handle.reached_target = true;
        }
        for request in requests {
            connection.queue_request(Request::new(request.piece, request.begin, request.length));
        }
    }

    fn request_metadata_chunks(&self, connection: &mut PeerConnection) {
        if self.has_metadata() {
            return;
        }
        if connection.remote_extension_id(UT_METADATA).is_none() {
            return;
        }
        let now = Instant::now();
        let chunk = {
            let exchange = self.metadata_exchange.lock().unwrap();
            match exchange.as_ref() {
                Some(exchange) if exchange.may_request(now) => {
                    exchange.missing_chunks().into_iter().next()
                }
                _ => None,
            }
        };
        if let Some(piece) = chunk {
            connection.queue_metadata_message(&MetadataMessage::Request { piece });
        }
    }

    fn send_have_diff(&self, connection: &mut PeerConnection, advertised: &mut Option<Bitfield>) {
        let current = match self.advertised_bitfield() {
            Some(current) => current,
            None => return,
        };
        match advertised {
            Some(previous) => {
                for piece in current.diff(previous) {
                    connection.queue_have(piece as u32);
                }
            }
            None => {
                // first advertisement after attach goes out as a bitfield
                if !current.is_empty() {
                    connection.queue_bitfield(current.as_bytes().to_vec());
                }
            }
        }
        *advertised = Some(current);
    }

    // ------------------------------------------------------------------------------------------------
    // Maintenance loop

    fn maintenance_loop(self: Arc<Self>) {
        let mut last_request_scan = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();

            // stale request scan runs on a tight cadence
            if now.duration_since(last_request_scan) >= Duration::from_millis(500) {
                last_request_scan = now;
                self.scan_request_timeouts(now);
            }

            self.dial_candidates(now);
            self.flag_slow_peers(now);
            self.announce_trackers(now);
            self.announce_dht(now);
            self.check_invariants();

            let (in_use, capacity) = {
                let swarm = self.swarm.lock().unwrap();
                (
                    swarm.connected_count() + swarm.connecting_count(),
                    self.context.config.max_peers_per_torrent,
                )
            };
            let interval = self
                .connection_manager
                .maintenance_interval(in_use, capacity)
                .min(Duration::from_millis(500));
            std::thread::sleep(interval);
        }
    }

    fn scan_request_timeouts(&self, now: Instant) {
        let timeout = Duration::from_secs(self.context.config.request_timeout_seconds);
        let cancels = match self.picker.lock().unwrap().as_mut() {
            Some(picker) => picker.scan_timeouts(now, timeout),
            None => Vec::new(),
        };
        for order in cancels {
            self.push_directive(
                order.peer,
                PeerDirective::Cancel(Request::new(order.piece, order.begin, order.length)),
            );
        }
    }

    fn dial_candidates(self: &Arc<Self>, now: Instant) {
        if !self.may_admit_peer() || self.state() == TorrentState::Error {
            return;
        }
        let slots = {
            let swarm = self.swarm.lock().unwrap();
            let in_use = swarm.connected_count() + swarm.connecting_count();
            self.context
                .config
                .max_peers_per_torrent
                .saturating_sub(in_use)
                .min(self.context.budget.available())
        };
        let candidates = {
            let swarm = self.swarm.lock().unwrap();
            self.connection_manager.pick_candidates(&swarm, slots, now)
        };
        for addr in candidates {
            self.swarm.lock().unwrap().mark_connecting(&addr, now);
            crate::peer::session::spawn_outbound(self, addr);
        }
    }

    fn flag_slow_peers(&self, now: Instant) {
        let flagged: Vec<(ConnectionId, String)> = {
            let handles = self.handles.lock().unwrap();
            handles
                .iter()
                .filter_map(|(id, handle)| {
                    let activity = PeerActivity {
                        // session-side flags live on the connection; the
                        // handle's rate and timestamps are enough here
                        peer_choking_us: handle.last_received.is_none(),
                        am_interested: true,
                        last_received: handle.last_received,
                        smoothed_rate_bps: handle.smoothed_rate,
                        connected_at: handle.connected_at,
                    };
                    self.connection_manager
                        .slow_peer_reason(&activity, now)
                        .map(|reason| (*id, reason))
                })
                .collect()
        };
        for (id, reason) in flagged {
            self.push_directive(id, PeerDirective::Close(reason));
        }
    }

    fn announce_trackers(&self, now: Instant) {
        let client = match &self.context.tracker_client {
            Some(client) => client.clone(),
            None => return,
        };
        let due: Vec<String> = {
            let trackers = self.trackers.lock().unwrap();
            trackers
                .iter()
                .filter(|t| t.is_due(now))
                .map(|t| t.url.clone())
                .collect()
        };
        for url in due {
            let left = {
                let data = self.data.lock().unwrap();
                match data.as_ref() {
                    Some(data) => data
                        .info
                        .total_length
                        .saturating_sub(self.downloaded()),
                    None => 0,
                }
            };
            let request = AnnounceRequest {
                url: url.clone(),
                info_hash: self.info_hash,
                peer_id: self.context.local_peer_id,
                port: self.context.config.tcp_port,
                uploaded: self.uploaded(),
                downloaded: self.downloaded(),
                left,
                event: AnnounceEvent::None,
            };
            let outcome = client.announce(&request);
            let mut trackers = self.trackers.lock().unwrap();
            let schedule = match trackers.iter_mut().find(|t| t.url == url) {
                Some(schedule) => schedule,
                None => continue,
            };
            match outcome {
                Ok(response) => {
                    schedule.on_success(response.interval, now);
                    drop(trackers);
                    let mut swarm = self.swarm.lock().unwrap();
                    for peer in response.peers {
                        swarm.add_peer(peer, PeerSource::Tracker);
                    }
                }
                Err(err) => {
                    warn!("tracker {} failed: {:?}", url, err);
                    schedule.on_failure(now);
                }
            }
        }
    }

    fn announce_dht(&self, now: Instant) {
        let dht = match self.dht.lock().unwrap().as_ref() {
            Some(dht) => dht.clone(),
            None => return,
        };
        {
            let mut last = self.last_dht_announce.lock().unwrap();
            match *last {
                Some(at) if now.duration_since(at) < Duration::from_secs(300) => return,
                _ => *last = Some(now),
            }
        }
        let result = dht.find_peers(&self.info_hash);
        {
            let mut swarm = self.swarm.lock().unwrap();
            for peer in &result.peers {
                swarm.add_peer(*peer, PeerSource::Dht);
            }
        }
        let accepted = dht.announce(&self.info_hash, self.context.config.tcp_port);
        debug!(
            "dht: {} peers found, announce accepted by {} nodes",
            result.peers.len(),
            accepted
        );
    }

    fn check_invariants(&self) {
        let handle_count = self.handles.lock().unwrap().len();
        let swarm_connected = self.swarm.lock().unwrap().connected_count();
        if handle_count.abs_diff(swarm_connected) > INVARIANT_HEADROOM {
            self.emit(EngineEvent::InvariantViolation {
                info_hash: self.info_hash,
                description: format!(
                    "connected sessions ({}) and swarm connected set ({}) disagree",
                    handle_count, swarm_connected
                ),
            });
        }

        let picker = self.picker.lock().unwrap();
        if let Some(picker) = picker.as_ref() {
            let outstanding = picker.outstanding_block_count();
            let pending_sum = picker.sum_requests_pending();
            if outstanding != pending_sum {
                self.emit(EngineEvent::InvariantViolation {
                    info_hash: self.info_hash,
                    description: format!(
                        "outstanding blocks ({}) and pending counters ({}) disagree",
                        outstanding, pending_sum
                    ),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::filesystem::MemoryFileSystem;
    use crate::adapters::hasher::Sha1Hasher;
    use crate::adapters::socket::NativeSocketFactory;
    use crate::common::magnet::Magnet;
    use crate::peer::extensions::handshake::ExtensionHandshake as WireExtensionHandshake;
    use crate::peer::handshake::Handshake;
    use crate::peer::peer_message::{Message, MessageId};
    use crate::session::store::MemorySessionStore;
    use bencoder::bencode::Bencode;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver};

    const CONFIG_PATH: &str = "config.cfg";
    const LOCAL_PEER_ID: [u8; 20] = *b"-DE0100-aaaaaaaaaaaa";
    const REMOTE_PEER_ID: [u8; 20] = *b"-XX0001-bbbbbbbbbbbb";

    #[test]
    fn test_torrent_file_initializes_metadata() {
        let (controller, events, _fs) = build_controller(&single_file_torrent(&[7u8; 1000]));

        assert!(controller.has_metadata());
        assert_eq!(controller.name(), "example");
        assert_eq!(controller.total_pieces(), 1);
        assert_eq!(controller.completed_pieces(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::TorrentReady(controller.info_hash())
        );
    }

    #[test]
    fn test_malformed_torrent_is_rejected() {
        let (context, _events, _fs) = build_context();
        let result = TorrentController::new(
            &TorrentSource::TorrentFile(b"not a torrent".to_vec()),
            context,
        );
        assert!(matches!(
            result,
            Err(TorrentControllerError::MalformedTorrent(_))
        ));
    }

    #[test]
    fn test_single_piece_round_trip() {
        let content = vec![7u8; 1000];
        let (controller, events, fs) = build_controller(&single_file_torrent(&content));
        let _ = events.try_recv(); // TorrentReady

        let (mut connection, addr) = connect_remote(&controller);

        // seeder's bitfield: it has the only piece
        feed(&controller, &mut connection, addr, Message::new(MessageId::Bitfield, vec![0x80]));
        // interest goes out before any unchoke
        let sent = connection.take_sendable(None);
        assert!(frames(&sent).iter().any(|(id, _)| *id == 2));

        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));
        let sent = connection.take_sendable(None);
        let request = frames(&sent)
            .into_iter()
            .find(|(id, _)| *id == 6)
            .expect("no request was sent");
        assert_eq!(Message::parse_request(&request.1).unwrap(), (0, 0, 1000));

        // the block arrives
        let mut payload = Vec::new();
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        payload.extend(&content);
        feed(&controller, &mut connection, addr, Message::new(MessageId::Piece, payload));

        assert_eq!(controller.completed_pieces(), 1);
        assert_eq!(controller.state(), TorrentState::Complete);
        assert_eq!(
            fs.read_at(Path::new("./download/example"), 0, 1000).unwrap(),
            content
        );
        let received: Vec<EngineEvent> = events.try_iter().collect();
        assert!(received.contains(&EngineEvent::PieceCompleted {
            info_hash: controller.info_hash(),
            piece: 0
        }));
        assert!(received.contains(&EngineEvent::TorrentComplete(controller.info_hash())));
    }

    #[test]
    fn test_choke_recovery_resets_pipeline() {
        // eight pieces of 16384
        let content = vec![3u8; 8 * 16384];
        let (controller, _events, _fs) = build_controller(&single_file_torrent(&content));
        let (mut connection, addr) = connect_remote(&controller);

        feed(&controller, &mut connection, addr, Message::new(MessageId::Bitfield, vec![0xff]));
        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));

        let id = connection.id();
        assert_eq!(controller.requests_pending_for(id), 8);
        assert_eq!(controller.outstanding_requests(), 8);

        feed(&controller, &mut connection, addr, Message::new(MessageId::Choke, vec![]));
        assert_eq!(controller.requests_pending_for(id), 0);
        assert_eq!(controller.outstanding_requests(), 0);

        // unchoke refills to the target depth
        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));
        assert_eq!(controller.requests_pending_for(id), 8);
    }

    #[test]
    fn test_sole_contributor_ban_on_corrupt_piece() {
        let content = vec![7u8; 1000];
        let (controller, _events, _fs) = build_controller(&single_file_torrent(&content));
        let (mut connection, addr) = connect_remote(&controller);

        feed(&controller, &mut connection, addr, Message::new(MessageId::Bitfield, vec![0x80]));
        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));
        connection.take_sendable(None);

        // wrong bytes of the right length
        let mut payload = Vec::new();
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        payload.extend(vec![0u8; 1000]);
        feed(&controller, &mut connection, addr, Message::new(MessageId::Piece, payload));

        assert_eq!(controller.completed_pieces(), 0);
        assert!(controller.is_peer_banned(&addr));
        let directives = controller.take_directives(connection.id());
        assert!(directives
            .iter()
            .any(|d| matches!(d, PeerDirective::Close(reason) if reason.contains("sole contributor"))));
        // the piece is requestable again
        assert_eq!(controller.outstanding_requests(), 0);
    }

    #[test]
    fn test_magnet_metadata_exchange() {
        let torrent_bytes = single_file_torrent(&[9u8; 1000]);
        let meta = MetaInfo::from_bytes(&torrent_bytes, &Sha1Hasher).unwrap();

        let magnet = Magnet {
            info_hash: meta.info_hash,
            display_name: None,
            trackers: vec![],
        };
        let (context, events, _fs) = build_context();
        let controller =
            TorrentController::new(&TorrentSource::Magnet(magnet), context).unwrap();
        assert!(!controller.has_metadata());
        assert_eq!(controller.state(), TorrentState::Initializing);

        let (mut connection, addr) = connect_remote(&controller);
        // remote advertises ut_metadata and the dict size
        let mut payload = vec![0u8];
        payload.extend(
            WireExtensionHandshake::local(6881, Some(meta.info_bytes.len() as i64)).encode(),
        );
        feed(&controller, &mut connection, addr, Message::new(MessageId::Extended, payload));

        // a metadata request goes out on the next drive
        let mut advertised = None;
        controller.drive_peer(&mut connection, &mut advertised);
        let sent = connection.take_sendable(None);
        assert!(frames(&sent).iter().any(|(id, _)| *id == 20));

        // the single chunk arrives
        controller.handle_peer_events(
            &mut connection,
            &addr,
            vec![PeerEvent::MetadataReceived(MetadataMessage::Data {
                piece: 0,
                total_size: meta.info_bytes.len() as i64,
                payload: meta.info_bytes.clone(),
            })],
        );

        assert!(controller.has_metadata());
        assert_eq!(controller.name(), "example");
        let received: Vec<EngineEvent> = events.try_iter().collect();
        assert!(received.iter().any(|e| matches!(
            e,
            EngineEvent::MetadataResolved { info_hash, .. } if *info_hash == controller.info_hash()
        )));
        assert!(received.contains(&EngineEvent::TorrentReady(controller.info_hash())));
    }

    #[test]
    fn test_metadata_mismatch_restarts_exchange() {
        let magnet = Magnet {
            info_hash: InfoHash::new([0xcd; 20]),
            display_name: None,
            trackers: vec![],
        };
        let (context, _events, _fs) = build_context();
        let controller =
            TorrentController::new(&TorrentSource::Magnet(magnet), context).unwrap();
        let (mut connection, addr) = connect_remote(&controller);

        let bogus_info = Bencode::encode(&Bencode::BDict(BTreeMap::new()));
        let mut payload = vec![0u8];
        payload.extend(
            WireExtensionHandshake::local(6881, Some(bogus_info.len() as i64)).encode(),
        );
        feed(&controller, &mut connection, addr, Message::new(MessageId::Extended, payload));

        controller.handle_peer_events(
            &mut connection,
            &addr,
            vec![PeerEvent::MetadataReceived(MetadataMessage::Data {
                piece: 0,
                total_size: bogus_info.len() as i64,
                payload: bogus_info,
            })],
        );

        // hash mismatch: still no metadata, exchange restarted with backoff
        assert!(!controller.has_metadata());
        assert_eq!(controller.state(), TorrentState::Initializing);
        let mut advertised = None;
        controller.drive_peer(&mut connection, &mut advertised);
        let sent = connection.take_sendable(None);
        // nothing is re-requested while the backoff runs
        assert!(!frames(&sent).iter().any(|(id, _)| *id == 20));
    }

    #[test]
    fn test_set_file_priority_is_idempotent() {
        let (controller, _events, _fs) = build_controller(&two_file_torrent());

        let changed = controller
            .set_file_priority(0, FilePriority::Skip)
            .unwrap();
        assert_eq!(changed, 1);
        let again = controller
            .set_file_priority(0, FilePriority::Skip)
            .unwrap();
        assert_eq!(again, 0);

        let restored = controller
            .set_file_priority(0, FilePriority::Normal)
            .unwrap();
        assert_eq!(restored, 1);
    }

    #[test]
    fn test_set_file_priority_without_metadata_fails() {
        let magnet = Magnet {
            info_hash: InfoHash::new([0xab; 20]),
            display_name: None,
            trackers: vec![],
        };
        let (context, _events, _fs) = build_context();
        let controller =
            TorrentController::new(&TorrentSource::Magnet(magnet), context).unwrap();

        assert!(matches!(
            controller.set_file_priority(0, FilePriority::Skip),
            Err(TorrentControllerError::NoMetadata)
        ));
    }

    #[test]
    fn test_recheck_data_finds_existing_bytes() {
        let content = vec![5u8; 1000];
        let (controller, _events, fs) = build_controller(&single_file_torrent(&content));
        assert_eq!(controller.completed_pieces(), 0);

        fs.write_at(Path::new("./download/example"), &content, 0)
            .unwrap();
        controller.recheck_data().unwrap();

        assert_eq!(controller.completed_pieces(), 1);
        assert_eq!(controller.state(), TorrentState::Complete);
    }

    #[test]
    fn test_boundary_piece_lands_in_parts_file() {
        let (controller, _events, fs) = build_controller(&two_file_torrent());
        controller.set_file_priority(0, FilePriority::Skip).unwrap();

        let (mut connection, addr) = connect_remote(&controller);
        feed(&controller, &mut connection, addr, Message::new(MessageId::Bitfield, vec![0xfe]));
        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));

        // pieces 0-2 are blacklisted, so the boundary piece 3 is requested
        // first, sequentially
        let sent = connection.take_sendable(None);
        let first_request = frames(&sent)
            .into_iter()
            .find(|(id, _)| *id == 6)
            .expect("no request was sent");
        let (piece, begin, _) = Message::parse_request(&first_request.1).unwrap();
        assert_eq!((piece, begin), (3, 0));

        let piece3 = two_file_piece_bytes(3);
        let mut payload = Vec::new();
        payload.extend(3u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        payload.extend(&piece3);
        feed(&controller, &mut connection, addr, Message::new(MessageId::Piece, payload));

        // owned internally, parked in the sidecar, never advertised
        assert_eq!(controller.completed_pieces(), 1);
        assert!(controller.have_bitfield().unwrap().get(3));
        assert!(!controller.can_serve_piece(3));
        assert!(!controller.advertised_bitfield().unwrap().get(3));
        let parts_path = format!("./download/{}.parts", controller.info_hash().to_hex());
        assert!(fs.exists(Path::new(&parts_path)));

        // only the wanted file's overlap reached the content files
        assert!(fs.exists(Path::new("./download/pair/b.bin")));
        assert!(!fs.exists(Path::new("./download/pair/a.bin")));
        let b_head = fs.read_at(Path::new("./download/pair/b.bin"), 0, 8).unwrap();
        assert_eq!(b_head, &piece3[(50_000 - 49_152)..(50_000 - 49_152) + 8]);
    }

    #[test]
    fn test_self_connection_is_rejected_on_attach() {
        let content = vec![7u8; 1000];
        let (controller, _events, _fs) = build_controller(&single_file_torrent(&content));

        let mut connection = PeerConnection::outgoing(
            controller.next_connection_id(),
            LOCAL_PEER_ID,
            controller.info_hash(),
        );
        connection.take_sendable(None);
        // the remote turns out to be ourselves
        let own = Handshake::new(
            controller.info_hash().as_bytes().to_vec(),
            LOCAL_PEER_ID.to_vec(),
        );
        connection.on_data(&own.as_bytes());

        let addr: std::net::SocketAddr = "10.9.9.9:6881".parse().unwrap();
        assert!(!controller.attach_session(&connection, addr));
        assert!(controller.is_peer_banned(&addr));
    }

    #[test]
    fn test_detach_keeps_counts_consistent() {
        let content = vec![3u8; 8 * 16384];
        let (controller, _events, _fs) = build_controller(&single_file_torrent(&content));
        let (mut connection, addr) = connect_remote(&controller);
        feed(&controller, &mut connection, addr, Message::new(MessageId::Bitfield, vec![0xff]));
        feed(&controller, &mut connection, addr, Message::new(MessageId::Unchoke, vec![]));
        assert_eq!(controller.connected_peer_count(), 1);

        controller.detach_session(connection.id(), &addr, false);

        assert_eq!(controller.connected_peer_count(), 0);
        assert_eq!(controller.outstanding_requests(), 0);
    }

    // Auxiliary functions

    fn build_context() -> (TorrentContext, Receiver<EngineEvent>, Arc<MemoryFileSystem>) {
        let (events_tx, events_rx) = channel();
        let fs = Arc::new(MemoryFileSystem::new());
        let context = TorrentContext {
            config: crate::config::cfg::Cfg::new(CONFIG_PATH).unwrap(),
            local_peer_id: LOCAL_PEER_ID,
            fs: fs.clone(),
            hasher: Arc::new(Sha1Hasher),
            store: Arc::new(MemorySessionStore::new()),
            socket_factory: Arc::new(NativeSocketFactory),
            budget: ConnectionBudget::new(50),
            events: Mutex::new(events_tx),
            tracker_client: None,
        };
        (context, events_rx, fs)
    }

    fn build_controller(
        torrent_bytes: &[u8],
    ) -> (
        Arc<TorrentController>,
        Receiver<EngineEvent>,
        Arc<MemoryFileSystem>,
    ) {
        let (context, events, fs) = build_context();
        let controller = TorrentController::new(
            &TorrentSource::TorrentFile(torrent_bytes.to_vec()),
            context,
        )
        .unwrap();
        (controller, events, fs)
    }

    // a connected remote peer that has completed the handshake
    fn connect_remote(
        controller: &Arc<TorrentController>,
    ) -> (PeerConnection, std::net::SocketAddr) {
        let addr: std::net::SocketAddr = "10.0.0.99:6881".parse().unwrap();
        let mut connection = PeerConnection::outgoing(
            controller.next_connection_id(),
            controller.local_peer_id(),
            controller.info_hash(),
        );
        connection.take_sendable(None);
        let remote = Handshake::new(
            controller.info_hash().as_bytes().to_vec(),
            REMOTE_PEER_ID.to_vec(),
        );
        let events = connection.on_data(&remote.as_bytes());
        assert!(controller.attach_session(&connection, addr));
        controller.handle_peer_events(&mut connection, &addr, events);
        (connection, addr)
    }

    fn feed(
        controller: &Arc<TorrentController>,
        connection: &mut PeerConnection,
        addr: std::net::SocketAddr,
        message: Message,
    ) {
        let events = connection.on_data(&message.as_bytes());
        controller.handle_peer_events(connection, &addr, events);
    }

    // splits a sendable byte run into (type, payload) frames
    fn frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while bytes.len() >= 4 {
            let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            if length == 0 {
                bytes = &bytes[4..];
                continue;
            }
            out.push((bytes[4], bytes[5..4 + length].to_vec()));
            bytes = &bytes[4 + length..];
        }
        out
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        Sha1Hasher.sha1(data).to_vec()
    }

    fn single_file_torrent(content: &[u8]) -> Vec<u8> {
        let piece_length = 16384usize;
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length) {
            pieces.extend(sha1(chunk));
        }
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(content.len() as i64));
        info.insert(b"name".to_vec(), Bencode::BString(b"example".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(piece_length as i64));
        info.insert(b"pieces".to_vec(), Bencode::BString(pieces));

        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://tracker.example/announce".to_vec()),
        );
        top.insert(b"info".to_vec(), Bencode::BDict(info));
        Bencode::encode(&Bencode::BDict(top))
    }

    // 50000 + 50000 bytes in two files, seven pieces of 16384
    fn two_file_torrent() -> Vec<u8> {
        let mut pieces = Vec::new();
        for piece in 0..7 {
            pieces.extend(sha1(&two_file_piece_bytes(piece)));
        }

        let mut file_a = BTreeMap::new();
        file_a.insert(b"length".to_vec(), Bencode::BNumber(50_000));
        file_a.insert(
            b"path".to_vec(),
            Bencode::BList(vec![Bencode::BString(b"a.bin".to_vec())]),
        );
        let mut file_b = BTreeMap::new();
        file_b.insert(b"length".to_vec(), Bencode::BNumber(50_000));
        file_b.insert(
            b"path".to_vec(),
            Bencode::BList(vec![Bencode::BString(b"b.bin".to_vec())]),
        );

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Bencode::BString(b"pair".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(16384));
        info.insert(b"pieces".to_vec(), Bencode::BString(pieces));
        info.insert(
            b"files".to_vec(),
            Bencode::BList(vec![Bencode::BDict(file_a), Bencode::BDict(file_b)]),
        );

        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://tracker.example/announce".to_vec()),
        );
        top.insert(b"info".to_vec(), Bencode::BDict(info));
        Bencode::encode(&Bencode::BDict(top))
    }

    fn two_file_piece_bytes(piece: u32) -> Vec<u8> {
        let start = piece as usize * 16384;
        let end = (start + 16384).min(100_000);
        (start..end).map(|i| (i % 251) as u8).collect()
    }
}
