use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adapters::socket::Socket;
use crate::bandwidth::accounting::TrafficCategory;
use crate::common::bitfield::Bitfield;
use crate::config::cfg::EncryptionPolicy;
use crate::engine::hub::BudgetGuard;
use crate::peer::extensions::handshake::{ExtensionHandshake, UT_PEX};
use crate::peer::extensions::ut_pex::PexMessage;
use crate::torrent::controller::TorrentController;

use super::connection::PeerConnection;
use super::handshake::Handshake;

const READ_BUFFER_SIZE: usize = 16384;
const SOCKET_TICK: Duration = Duration::from_millis(500);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(100);
const PEX_INTERVAL: Duration = Duration::from_secs(60);

/// Dials an endpoint and runs a peer session on its own thread.
pub fn spawn_outbound(controller: &Arc<TorrentController>, addr: SocketAddr) {
    let guard = match controller.budget().try_acquire() {
        Some(guard) => guard,
        None => {
            controller.connect_failed(&addr);
            return;
        }
    };
    let thread_controller = controller.clone();
    let builder = thread::Builder::new().name(format!("peer {}", addr));
    let spawned = builder.spawn(move || {
        let controller = thread_controller;
        let timeout = Duration::from_secs(controller.config().read_write_seconds_timeout);
        let socket = match controller.socket_factory().connect(addr, timeout) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("connect to {} failed: {}", addr, err);
                controller.connect_failed(&addr);
                return;
            }
        };
        let connection = PeerConnection::outgoing(
            controller.next_connection_id(),
            controller.local_peer_id(),
            controller.info_hash(),
        );
        PeerSession::new(controller, connection, socket, addr, guard).run();
    });
    if let Err(err) = spawned {
        warn!("could not spawn peer thread: {}", err);
        controller.connect_failed(&addr);
    }
}

/// Runs a session for an inbound socket whose handshake the server already
/// read and routed.
pub fn spawn_incoming(
    controller: &Arc<TorrentController>,
    socket: Box<dyn Socket>,
    remote: Handshake,
    guard: BudgetGuard,
) {
    let addr = match socket.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let controller = controller.clone();
    let builder = thread::Builder::new().name(format!("peer {}", addr));
    let spawned = builder.spawn(move || {
        let mut connection = PeerConnection::incoming(
            controller.next_connection_id(),
            controller.local_peer_id(),
            &remote,
            controller.info_hash(),
        );
        // the handshake was consumed before the torrent saw this peer;
        // attach re-checks self-connection with the recorded peer id
        if !controller.attach_session(&connection, addr) {
            connection.close();
            return;
        }
        if connection.supports_extensions() {
            let handshake = ExtensionHandshake::local(
                controller.config().tcp_port,
                controller.metadata_size(),
            );
            connection.queue_extension_handshake(&handshake);
        }
        if let Some(advertised) = controller.advertised_bitfield() {
            if !advertised.is_empty() {
                connection.queue_bitfield(advertised.as_bytes().to_vec());
            }
        }
        let mut session = PeerSession::new(controller, connection, socket, addr, guard);
        session.attached = true;
        session.advertised = session.controller.advertised_bitfield();
        session.run();
    });
    if let Err(err) = spawned {
        warn!("could not spawn peer thread: {}", err);
    }
}

/// One live peer connection's thread: socket I/O on one side, the torrent
/// controller on the other.
struct PeerSession {
    controller: Arc<TorrentController>,
    connection: PeerConnection,
    socket: Box<dyn Socket>,
    addr: SocketAddr,
    attached: bool,
    advertised: Option<Bitfield>,
    last_pex: Vec<SocketAddr>,
    last_pex_at: Instant,
    last_sent_at: Instant,
    _budget: BudgetGuard,
}

impl PeerSession {
    fn new(
        controller: Arc<TorrentController>,
        connection: PeerConnection,
        socket: Box<dyn Socket>,
        addr: SocketAddr,
        budget: BudgetGuard,
    ) -> PeerSession {
        let now = Instant::now();
        PeerSession {
            controller,
            connection,
            socket,
            addr,
            attached: false,
            advertised: None,
            last_pex: Vec::new(),
            last_pex_at: now,
            last_sent_at: now,
            _budget: budget,
        }
    }

    fn run(mut self) {
        // `prefer` is the factory's business; `required` is enforced here
        if self.controller.config().encryption_policy == EncryptionPolicy::Required
            && !self.socket.is_encrypted()
        {
            debug!("dropping plaintext peer {}: encryption required", self.addr);
            self.finish(false);
            return;
        }
        if self.socket.set_timeouts(Some(SOCKET_TICK)).is_err() {
            self.finish(true);
            return;
        }

        let mut failed = false;
        loop {
            if !self.controller.is_running() {
                break;
            }

            if !self.flush() {
                failed = true;
                break;
            }
            if self.connection.is_closed() {
                break;
            }

            let mut buffer = [0u8; READ_BUFFER_SIZE];
            match self.socket.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.controller
                        .traffic
                        .received
                        .record(TrafficCategory::PeerProtocol, n as u64);
                    let payload_before = self.connection.payload_received();
                    let events = self.connection.on_data(&buffer[..n]);
                    let payload_delta = self.connection.payload_received() - payload_before;
                    if payload_delta > 0 {
                        self.controller
                            .traffic
                            .received
                            .record(TrafficCategory::PeerPayload, payload_delta);
                    }
                    if !self.attached && self.connection.peer_id().is_some() {
                        if !self.controller.attach_session(&self.connection, self.addr) {
                            self.connection.close();
                            break;
                        }
                        self.attached = true;
                    }
                    self.controller.handle_peer_events(
                        &mut self.connection,
                        &self.addr,
                        events,
                    );
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("peer {} read error: {}", self.addr, err);
                    failed = true;
                    break;
                }
            }

            if self.attached {
                self.controller
                    .drive_peer(&mut self.connection, &mut self.advertised);
                self.maybe_send_pex();
                self.maybe_keep_alive();
            }
        }
        // push anything still queued (a CANCEL, a final HAVE) best-effort
        let _ = self.flush();
        self.finish(failed);
    }

    // Returns false when the socket rejected the write.
    fn flush(&mut self) -> bool {
        let payload_before = self.connection.payload_sent();
        let bytes = self
            .connection
            .take_sendable(Some(&self.controller.rate.upload));
        if bytes.is_empty() {
            return true;
        }
        self.controller
            .traffic
            .sent
            .record(TrafficCategory::PeerProtocol, bytes.len() as u64);
        let payload_delta = self.connection.payload_sent() - payload_before;
        if payload_delta > 0 {
            self.controller
                .traffic
                .sent
                .record(TrafficCategory::PeerPayload, payload_delta);
        }
        self.last_sent_at = Instant::now();
        self.socket.write_all(&bytes).is_ok()
    }

    fn maybe_send_pex(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_pex_at) < PEX_INTERVAL {
            return;
        }
        self.last_pex_at = now;
        if self.connection.remote_extension_id(UT_PEX).is_none() {
            return;
        }
        let snapshot = self.controller.pex_snapshot(&self.addr);
        let added: Vec<SocketAddr> = snapshot
            .iter()
            .filter(|a| !self.last_pex.contains(a))
            .copied()
            .collect();
        let dropped: Vec<SocketAddr> = self
            .last_pex
            .iter()
            .filter(|a| !snapshot.contains(a))
            .copied()
            .collect();
        if added.is_empty() && dropped.is_empty() {
            return;
        }
        let flags = vec![0u8; added.iter().filter(|a| a.is_ipv4()).count()];
        self.connection.queue_pex_message(&PexMessage {
            added,
            added_flags: flags,
            dropped,
        });
        self.last_pex = snapshot;
    }

    fn maybe_keep_alive(&mut self) {
        if Instant::now().duration_since(self.last_sent_at) >= KEEP_ALIVE_INTERVAL {
            self.connection.queue_keep_alive();
        }
    }

    fn finish(mut self, failed: bool) {
        self.socket.shutdown();
        self.controller
            .detach_session(self.connection.id(), &self.addr, failed);
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::filesystem::{FileSystem, MemoryFileSystem};
    use crate::adapters::hasher::{Hasher, Sha1Hasher};
    use crate::adapters::socket::{memory_socket_pair, MemorySocket, NativeSocketFactory};
    use crate::engine::hub::ConnectionBudget;
    use crate::peer::peer_message::{Message, MessageId};
    use crate::session::store::MemorySessionStore;
    use crate::torrent::controller::{TorrentContext, TorrentController};
    use crate::torrent::source::TorrentSource;
    use bencoder::bencode::Bencode;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::mpsc::channel;

    const CONFIG_PATH: &str = "config.cfg";
    const REMOTE_PEER_ID: [u8; 20] = *b"-XX0001-bbbbbbbbbbbb";

    // The whole single-piece exchange across a real session thread and an
    // in-memory socket pair: handshake, bitfield, unchoke, request, piece.
    #[test]
    fn test_incoming_seeder_feeds_a_download_end_to_end() {
        let content = vec![7u8; 1000];
        let (controller, fs) = build_controller(&single_file_torrent(&content));
        controller.start();

        let (engine_side, remote_side) = memory_socket_pair();
        let mut engine_socket: Box<dyn Socket> = Box::new(engine_side);
        let mut remote = RemotePeer::new(remote_side);

        // the remote (a seeder) dialed us and leads with its handshake
        remote
            .socket
            .write_all(
                &Handshake::new(
                    controller.info_hash().as_bytes().to_vec(),
                    REMOTE_PEER_ID.to_vec(),
                )
                .as_bytes(),
            )
            .unwrap();

        // the engine server reads and routes it, then hands the socket over
        let mut handshake_buffer = [0u8; 68];
        engine_socket.read_exact(&mut handshake_buffer).unwrap();
        let handshake = Handshake::from_bytes(&handshake_buffer).unwrap();
        let budget = ConnectionBudget::new(10);
        spawn_incoming(
            &controller,
            engine_socket,
            handshake,
            budget.try_acquire().unwrap(),
        );

        // our handshake reply comes back
        remote.read_exact(68);

        remote
            .socket
            .write_all(&Message::new(MessageId::Bitfield, vec![0x80]).as_bytes())
            .unwrap();
        remote
            .socket
            .write_all(&Message::new(MessageId::Unchoke, vec![]).as_bytes())
            .unwrap();

        // the leech asks for the only block
        let request = remote.wait_for_frame(6);
        assert_eq!(Message::parse_request(&request).unwrap(), (0, 0, 1000));

        let mut payload = Vec::new();
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        payload.extend(&content);
        remote
            .socket
            .write_all(&Message::new(MessageId::Piece, payload).as_bytes())
            .unwrap();

        // the verified piece lands in storage
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.completed_pieces() == 0 {
            assert!(Instant::now() < deadline, "piece never completed");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            fs.read_at(Path::new("./download/example"), 0, 1000).unwrap(),
            content
        );

        // a HAVE for the fresh piece reaches the seeder
        let have = remote.wait_for_frame(4);
        assert_eq!(Message::parse_have(&have).unwrap(), 0);

        controller.stop();
    }

    // Auxiliary functions

    struct RemotePeer {
        socket: MemorySocket,
        buffer: Vec<u8>,
        deadline: Instant,
    }

    impl RemotePeer {
        fn new(socket: MemorySocket) -> RemotePeer {
            socket
                .set_timeouts(Some(Duration::from_millis(100)))
                .unwrap();
            RemotePeer {
                socket,
                buffer: Vec::new(),
                deadline: Instant::now() + Duration::from_secs(5),
            }
        }

        fn read_exact(&mut self, count: usize) -> Vec<u8> {
            while self.buffer.len() < count {
                self.pump();
            }
            self.buffer.drain(..count).collect()
        }

        // skips frames until one of the wanted type shows up
        fn wait_for_frame(&mut self, wanted: u8) -> Vec<u8> {
            loop {
                while self.buffer.len() >= 4 {
                    let length = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    if length == 0 {
                        self.buffer.drain(..4);
                        continue;
                    }
                    if self.buffer.len() < 4 + length {
                        break;
                    }
                    let frame_type = self.buffer[4];
                    let payload: Vec<u8> = self.buffer[5..4 + length].to_vec();
                    self.buffer.drain(..4 + length);
                    if frame_type == wanted {
                        return payload;
                    }
                }
                self.pump();
            }
        }

        fn pump(&mut self) {
            assert!(
                Instant::now() < self.deadline,
                "timed out waiting for peer traffic"
            );
            let mut chunk = [0u8; 4096];
            match self.socket.read(&mut chunk) {
                Ok(0) => panic!("peer closed the connection"),
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {}", err),
            }
        }
    }

    fn build_controller(
        torrent_bytes: &[u8],
    ) -> (Arc<TorrentController>, Arc<MemoryFileSystem>) {
        let (events_tx, _events_rx) = channel();
        let fs = Arc::new(MemoryFileSystem::new());
        let context = TorrentContext {
            config: crate::config::cfg::Cfg::new(CONFIG_PATH).unwrap(),
            local_peer_id: *b"-DE0100-aaaaaaaaaaaa",
            fs: fs.clone(),
            hasher: Arc::new(Sha1Hasher),
            store: Arc::new(MemorySessionStore::new()),
            socket_factory: Arc::new(NativeSocketFactory),
            budget: ConnectionBudget::new(50),
            events: std::sync::Mutex::new(events_tx),
            tracker_client: None,
        };
        let controller = TorrentController::new(
            &TorrentSource::TorrentFile(torrent_bytes.to_vec()),
            context,
        )
        .unwrap();
        (controller, fs)
    }

    fn single_file_torrent(content: &[u8]) -> Vec<u8> {
        let hash = Sha1Hasher.sha1(content);
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(content.len() as i64));
        info.insert(b"name".to_vec(), Bencode::BString(b"example".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(16384));
        info.insert(b"pieces".to_vec(), Bencode::BString(hash.to_vec()));

        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Bencode::BString(b"http://tracker.example/announce".to_vec()),
        );
        top.insert(b"info".to_vec(), Bencode::BDict(info));
        Bencode::encode(&Bencode::BDict(top))
    }
}
