use std::collections::VecDeque;

use crate::bandwidth::rate_limiter::TokenBucket;
use crate::common::chunked_buffer::ChunkedBuffer;
use crate::common::info_hash::InfoHash;

use super::extensions::handshake::{
    ExtensionHandshake, LOCAL_UT_METADATA_ID, LOCAL_UT_PEX_ID, UT_METADATA, UT_PEX,
};
use super::extensions::ut_metadata::MetadataMessage;
use super::extensions::ut_pex::PexMessage;
use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::peer_message::{Message, MessageId, Request};

/// Identifies one live connection within a torrent.
pub type ConnectionId = u64;

/// Largest frame accepted from a peer. A piece message is one block plus
/// headers; bitfields of even very large torrents fit well under this.
pub const MAX_MESSAGE_LENGTH: u32 = 16384 * 10;

/// Protocol phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Handshaking,
    /// Handshakes exchanged, extension handshake outstanding.
    Extended,
    Ready,
    Closed,
}

/// What the wire parser surfaced from received bytes.
#[derive(Debug, PartialEq)]
pub enum PeerEvent {
    HandshakeCompleted {
        info_hash: InfoHash,
        peer_id: [u8; 20],
        supports_extensions: bool,
    },
    ExtensionHandshakeReceived,
    KeepAlive,
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw bitfield bytes; the owner parses them once the piece count is
    /// known.
    BitfieldReceived(Vec<u8>),
    BlockReceived {
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    },
    RequestReceived {
        piece: u32,
        begin: u32,
        length: u32,
    },
    CancelReceived {
        piece: u32,
        begin: u32,
        length: u32,
    },
    PortReceived(u16),
    MetadataReceived(MetadataMessage),
    PexReceived(PexMessage),
    /// The peer broke protocol; the connection is now closed.
    ProtocolViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Control,
    Request { piece: u32, begin: u32, length: u32 },
    Cancel,
    Piece { payload_length: u32 },
}

#[derive(Debug)]
struct OutgoingFrame {
    bytes: Vec<u8>,
    kind: FrameKind,
}

/// The wire-protocol state machine of one peer connection: rx framing, tx
/// queue with cancel priority, protocol flags and extension ID mapping.
///
/// Socket I/O lives elsewhere; bytes come in through `on_data` and leave
/// through `take_sendable`.
pub struct PeerConnection {
    id: ConnectionId,
    state: WireState,
    rx: ChunkedBuffer,
    send_queue: VecDeque<OutgoingFrame>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    local_peer_id: [u8; 20],
    expected_info_hash: Option<InfoHash>,
    remote_info_hash: Option<InfoHash>,
    peer_id: Option<[u8; 20]>,
    remote_supports_extensions: bool,
    remote_extensions: Option<ExtensionHandshake>,
    bytes_received: u64,
    bytes_sent: u64,
    payload_received: u64,
    payload_sent: u64,
}

impl PeerConnection {
    /// An outbound connection; `expected_info_hash` is verified against the
    /// remote handshake.
    pub fn outgoing(
        id: ConnectionId,
        local_peer_id: [u8; 20],
        expected_info_hash: InfoHash,
    ) -> PeerConnection {
        let mut connection = Self::new(id, local_peer_id, Some(expected_info_hash));
        let handshake =
            Handshake::new(expected_info_hash.as_bytes().to_vec(), local_peer_id.to_vec());
        connection.send_queue.push_back(OutgoingFrame {
            bytes: handshake.as_bytes(),
            kind: FrameKind::Control,
        });
        connection
    }

    /// An inbound connection whose 68-byte handshake the server already
    /// consumed to route it. Our handshake reply is queued here.
    pub fn incoming(
        id: ConnectionId,
        local_peer_id: [u8; 20],
        remote: &Handshake,
        info_hash: InfoHash,
    ) -> PeerConnection {
        let mut connection = Self::new(id, local_peer_id, Some(info_hash));
        connection.remote_info_hash = Some(info_hash);
        let mut peer_id = [0u8; 20];
        if remote.peer_id.len() == 20 {
            peer_id.copy_from_slice(&remote.peer_id);
            connection.peer_id = Some(peer_id);
        }
        connection.remote_supports_extensions = remote.supports_extensions();
        connection.state = if remote.supports_extensions() {
            WireState::Extended
        } else {
            WireState::Ready
        };
        let reply = Handshake::new(info_hash.as_bytes().to_vec(), local_peer_id.to_vec());
        connection.send_queue.push_back(OutgoingFrame {
            bytes: reply.as_bytes(),
            kind: FrameKind::Control,
        });
        connection
    }

    fn new(
        id: ConnectionId,
        local_peer_id: [u8; 20],
        expected_info_hash: Option<InfoHash>,
    ) -> PeerConnection {
        PeerConnection {
            id,
            state: WireState::Handshaking,
            rx: ChunkedBuffer::new(),
            send_queue: VecDeque::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            local_peer_id,
            expected_info_hash,
            remote_info_hash: None,
            peer_id: None,
            remote_supports_extensions: false,
            remote_extensions: None,
            bytes_received: 0,
            bytes_sent: 0,
            payload_received: 0,
            payload_sent: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> WireState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == WireState::Closed
    }

    pub fn close(&mut self) {
        self.state = WireState::Closed;
        self.send_queue.clear();
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id
    }

    pub fn remote_info_hash(&self) -> Option<InfoHash> {
        self.remote_info_hash
    }

    /// True when the remote handshake carried our own peer id. Checked again
    /// by the torrent when it attaches listeners, since an inbound peer id
    /// can arrive before the torrent does.
    pub fn is_self_connection(&self) -> bool {
        self.peer_id == Some(self.local_peer_id)
    }

    pub fn supports_extensions(&self) -> bool {
        self.remote_supports_extensions
    }

    /// The remote's message ID for an extension we both support.
    pub fn remote_extension_id(&self, extension: &str) -> Option<u8> {
        self.remote_extensions.as_ref().and_then(|e| e.remote_id(extension))
    }

    pub fn remote_metadata_size(&self) -> Option<i64> {
        self.remote_extensions.as_ref().and_then(|e| e.metadata_size)
    }

    pub fn remote_listen_port(&self) -> Option<u16> {
        self.remote_extensions.as_ref().and_then(|e| e.p)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn payload_received(&self) -> u64 {
        self.payload_received
    }

    pub fn payload_sent(&self) -> u64 {
        self.payload_sent
    }

    // ------------------------------------------------------------------------------------------------
    // Receiving

    /// Feeds socket bytes in and returns the events they produced.
    pub fn on_data(&mut self, bytes: &[u8]) -> Vec<PeerEvent> {
        if self.state == WireState::Closed {
            return Vec::new();
        }
        self.bytes_received += bytes.len() as u64;
        self.rx.append(bytes.to_vec());

        let mut events = Vec::new();
        loop {
            match self.state {
                WireState::Closed => break,
                WireState::Handshaking => {
                    if self.rx.len() < HANDSHAKE_LENGTH {
                        break;
                    }
                    let buffer = match self.rx.consume(HANDSHAKE_LENGTH) {
                        Some(buffer) => buffer,
                        None => break,
                    };
                    match self.process_handshake(&buffer) {
                        Ok(event) => events.push(event),
                        Err(reason) => {
                            events.push(self.violation(reason));
                            break;
                        }
                    }
                }
                _ => match self.next_frame() {
                    FrameStep::Incomplete => break,
                    FrameStep::KeepAlive => events.push(PeerEvent::KeepAlive),
                    FrameStep::Violation(reason) => {
                        events.push(self.violation(reason));
                        break;
                    }
                    FrameStep::Frame(body) => match self.process_message(&body) {
                        Ok(event) => events.push(event),
                        Err(reason) => {
                            events.push(self.violation(reason));
                            break;
                        }
                    },
                },
            }
        }
        events
    }

    fn process_handshake(&mut self, buffer: &[u8]) -> Result<PeerEvent, String> {
        let handshake = Handshake::from_bytes(buffer)
            .map_err(|_| "malformed handshake".to_string())?;
        let info_hash = InfoHash::from_slice(&handshake.info_hash)
            .map_err(|_| "malformed handshake infohash".to_string())?;

        if let Some(expected) = self.expected_info_hash {
            if info_hash != expected {
                return Err(format!(
                    "handshake infohash mismatch: expected {}, got {}",
                    expected, info_hash
                ));
            }
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&handshake.peer_id);
        self.peer_id = Some(peer_id);
        self.remote_info_hash = Some(info_hash);
        self.remote_supports_extensions = handshake.supports_extensions();
        self.state = if handshake.supports_extensions() {
            WireState::Extended
        } else {
            WireState::Ready
        };

        if self.is_self_connection() {
            return Err("connected to ourselves".to_string());
        }

        Ok(PeerEvent::HandshakeCompleted {
            info_hash,
            peer_id,
            supports_extensions: handshake.supports_extensions(),
        })
    }

    fn next_frame(&mut self) -> FrameStep {
        let length = match self.rx.peek_u32(0) {
            Some(length) => length,
            None => return FrameStep::Incomplete,
        };
        if length == 0 {
            self.rx.discard(4);
            return FrameStep::KeepAlive;
        }
        if length > MAX_MESSAGE_LENGTH {
            return FrameStep::Violation(format!("oversized message: {} bytes", length));
        }
        if self.rx.len() < 4 + length as usize {
            return FrameStep::Incomplete;
        }
        self.rx.discard(4);
        match self.rx.consume(length as usize) {
            Some(body) => FrameStep::Frame(body),
            None => FrameStep::Incomplete,
        }
    }

    fn process_message(&mut self, body: &[u8]) -> Result<PeerEvent, String> {
        let message = Message::from_bytes(body)
            .map_err(|e| format!("unparseable message: {:?}", e))?;
        match message.id {
            MessageId::Choke => {
                self.peer_choking = true;
                Ok(PeerEvent::Choked)
            }
            MessageId::Unchoke => {
                self.peer_choking = false;
                Ok(PeerEvent::Unchoked)
            }
            MessageId::Interested => {
                self.peer_interested = true;
                Ok(PeerEvent::Interested)
            }
            MessageId::NotInterested => {
                self.peer_interested = false;
                Ok(PeerEvent::NotInterested)
            }
            MessageId::Have => {
                let piece = Message::parse_have(&message.payload)
                    .map_err(|e| format!("bad have: {:?}", e))?;
                Ok(PeerEvent::Have(piece))
            }
            MessageId::Bitfield => Ok(PeerEvent::BitfieldReceived(message.payload)),
            MessageId::Request => {
                let (piece, begin, length) = Message::parse_request(&message.payload)
                    .map_err(|e| format!("bad request: {:?}", e))?;
                Ok(PeerEvent::RequestReceived {
                    piece,
                    begin,
                    length,
                })
            }
            MessageId::Piece => {
                let (piece, begin, data) = Message::parse_piece(&message.payload)
                    .map_err(|e| format!("bad piece: {:?}", e))?;
                self.payload_received += data.len() as u64;
                Ok(PeerEvent::BlockReceived {
                    piece,
                    begin,
                    data: data.to_vec(),
                })
            }
            MessageId::Cancel => {
                let (piece, begin, length) = Message::parse_request(&message.payload)
                    .map_err(|e| format!("bad cancel: {:?}", e))?;
                self.drop_queued_piece(piece, begin);
                Ok(PeerEvent::CancelReceived {
                    piece,
                    begin,
                    length,
                })
            }
            MessageId::Port => {
                let port = Message::parse_port(&message.payload)
                    .map_err(|e| format!("bad port: {:?}", e))?;
                Ok(PeerEvent::PortReceived(port))
            }
            MessageId::Extended => self.process_extended(&message.payload),
        }
    }

    fn process_extended(&mut self, payload: &[u8]) -> Result<PeerEvent, String> {
        if payload.is_empty() {
            return Err("empty extended message".to_string());
        }
        match payload[0] {
            0 => {
                let handshake = ExtensionHandshake::decode(&payload[1..])
                    .map_err(|e| format!("bad extension handshake: {:?}", e))?;
                self.remote_extensions = Some(handshake);
                if self.state == WireState::Extended {
                    self.state = WireState::Ready;
                }
                Ok(PeerEvent::ExtensionHandshakeReceived)
            }
            LOCAL_UT_METADATA_ID => {
                let message = MetadataMessage::decode(&payload[1..])
                    .map_err(|e| format!("bad ut_metadata message: {:?}", e))?;
                Ok(PeerEvent::MetadataReceived(message))
            }
            LOCAL_UT_PEX_ID => {
                let message = PexMessage::decode(&payload[1..])
                    .map_err(|e| format!("bad ut_pex message: {:?}", e))?;
                Ok(PeerEvent::PexReceived(message))
            }
            other => Err(format!("unknown extension id: {}", other)),
        }
    }

    fn violation(&mut self, reason: String) -> PeerEvent {
        self.close();
        PeerEvent::ProtocolViolation(reason)
    }

    // ------------------------------------------------------------------------------------------------
    // Sending

    pub fn queue_message(&mut self, message: Message) {
        self.send_queue.push_back(OutgoingFrame {
            bytes: message.as_bytes(),
            kind: FrameKind::Control,
        });
    }

    pub fn queue_keep_alive(&mut self) {
        self.send_queue.push_back(OutgoingFrame {
            bytes: Message::keep_alive_bytes(),
            kind: FrameKind::Control,
        });
    }

    pub fn set_am_choking(&mut self, choking: bool) {
        if self.am_choking == choking {
            return;
        }
        self.am_choking = choking;
        let id = if choking {
            MessageId::Choke
        } else {
            MessageId::Unchoke
        };
        self.queue_message(Message::new(id, vec![]));
    }

    pub fn set_am_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        let id = if interested {
            MessageId::Interested
        } else {
            MessageId::NotInterested
        };
        self.queue_message(Message::new(id, vec![]));
    }

    pub fn queue_have(&mut self, piece: u32) {
        self.queue_message(Message::new(MessageId::Have, piece.to_be_bytes().to_vec()));
    }

    pub fn queue_bitfield(&mut self, bitfield_bytes: Vec<u8>) {
        self.queue_message(Message::new(MessageId::Bitfield, bitfield_bytes));
    }

    pub fn queue_request(&mut self, request: Request) {
        self.send_queue.push_back(OutgoingFrame {
            bytes: Message::new(MessageId::Request, request.as_bytes()).as_bytes(),
            kind: FrameKind::Request {
                piece: request.index,
                begin: request.begin,
                length: request.length,
            },
        });
    }

    /// Queues a cancel. If its request is still queued the pair annihilates;
    /// otherwise the cancel jumps ahead of every queued request.
    pub fn queue_cancel(&mut self, request: Request) {
        let queued = self.send_queue.iter().position(|frame| {
            frame.kind
                == FrameKind::Request {
                    piece: request.index,
                    begin: request.begin,
                    length: request.length,
                }
        });
        if let Some(index) = queued {
            self.send_queue.remove(index);
            return;
        }

        let cancel = OutgoingFrame {
            bytes: Message::new(MessageId::Cancel, request.as_bytes()).as_bytes(),
            kind: FrameKind::Cancel,
        };
        let first_request = self
            .send_queue
            .iter()
            .position(|frame| matches!(frame.kind, FrameKind::Request { .. }));
        match first_request {
            Some(index) => self.send_queue.insert(index, cancel),
            None => self.send_queue.push_back(cancel),
        }
    }

    pub fn queue_piece(&mut self, piece: u32, begin: u32, block: &[u8]) {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend(piece.to_be_bytes());
        payload.extend(begin.to_be_bytes());
        payload.extend(block);
        self.send_queue.push_back(OutgoingFrame {
            bytes: Message::new(MessageId::Piece, payload).as_bytes(),
            kind: FrameKind::Piece {
                payload_length: block.len() as u32,
            },
        });
    }

    pub fn queue_port(&mut self, port: u16) {
        self.queue_message(Message::new(MessageId::Port, port.to_be_bytes().to_vec()));
    }

    pub fn queue_extension_handshake(&mut self, handshake: &ExtensionHandshake) {
        let mut payload = vec![0u8];
        payload.extend(handshake.encode());
        self.queue_message(Message::new(MessageId::Extended, payload));
    }

    /// Queues a ut_metadata message using the remote's advertised ID.
    pub fn queue_metadata_message(&mut self, message: &MetadataMessage) -> bool {
        let remote_id = match self.remote_extension_id(UT_METADATA) {
            Some(id) => id,
            None => return false,
        };
        let mut payload = vec![remote_id];
        payload.extend(message.encode());
        self.queue_message(Message::new(MessageId::Extended, payload));
        true
    }

    /// Queues a ut_pex message using the remote's advertised ID.
    pub fn queue_pex_message(&mut self, message: &PexMessage) -> bool {
        let remote_id = match self.remote_extension_id(UT_PEX) {
            Some(id) => id,
            None => return false,
        };
        let mut payload = vec![remote_id];
        payload.extend(message.encode());
        self.queue_message(Message::new(MessageId::Extended, payload));
        true
    }

    // the peer cancelled a request we had not served yet
    fn drop_queued_piece(&mut self, piece: u32, begin: u32) {
        self.send_queue.retain(|frame| {
            if !matches!(frame.kind, FrameKind::Piece { .. }) {
                return true;
            }
            // piece frame layout: length(4) type(1) index(4) begin(4) block
            let mut index_bytes = [0u8; 4];
            index_bytes.copy_from_slice(&frame.bytes[5..9]);
            let mut begin_bytes = [0u8; 4];
            begin_bytes.copy_from_slice(&frame.bytes[9..13]);
            u32::from_be_bytes(index_bytes) != piece || u32::from_be_bytes(begin_bytes) != begin
        });
    }

    pub fn queued_frames(&self) -> usize {
        self.send_queue.len()
    }

    /// Drains sendable frames in order. Piece frames consult the upload
    /// bucket and defer the rest of the queue when tokens run out, so
    /// per-connection ordering is preserved.
    pub fn take_sendable(&mut self, upload_bucket: Option<&TokenBucket>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(front) = self.send_queue.front() {
            if let FrameKind::Piece { payload_length } = front.kind {
                if let Some(bucket) = upload_bucket {
                    if !bucket.try_consume(payload_length as u64) {
                        break;
                    }
                }
                self.payload_sent += payload_length as u64;
            }
            let frame = match self.send_queue.pop_front() {
                Some(frame) => frame,
                None => break,
            };
            out.extend(frame.bytes);
        }
        self.bytes_sent += out.len() as u64;
        out
    }
}

enum FrameStep {
    Incomplete,
    KeepAlive,
    Frame(Vec<u8>),
    Violation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_ID: [u8; 20] = [7u8; 20];
    const REMOTE_ID: [u8; 20] = [9u8; 20];

    #[test]
    fn test_outgoing_queues_handshake() {
        let mut connection = PeerConnection::outgoing(1, LOCAL_ID, hash());

        let bytes = connection.take_sendable(None);
        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[28..48], hash().as_bytes());
    }

    #[test]
    fn test_handshake_completes_and_enters_extended() {
        let mut connection = PeerConnection::outgoing(1, LOCAL_ID, hash());
        let remote = Handshake::new(hash().as_bytes().to_vec(), REMOTE_ID.to_vec());

        let events = connection.on_data(&remote.as_bytes());

        assert_eq!(
            events,
            vec![PeerEvent::HandshakeCompleted {
                info_hash: hash(),
                peer_id: REMOTE_ID,
                supports_extensions: true,
            }]
        );
        assert_eq!(connection.state(), WireState::Extended);
    }

    #[test]
    fn test_handshake_infohash_mismatch_closes() {
        let mut connection = PeerConnection::outgoing(1, LOCAL_ID, hash());
        let wrong = InfoHash::new([0xee; 20]);
        let remote = Handshake::new(wrong.as_bytes().to_vec(), REMOTE_ID.to_vec());

        let events = connection.on_data(&remote.as_bytes());

        assert!(matches!(events[0], PeerEvent::ProtocolViolation(_)));
        assert!(connection.is_closed());
    }

    #[test]
    fn test_self_connection_detected() {
        let mut connection = PeerConnection::outgoing(1, LOCAL_ID, hash());
        let own = Handshake::new(hash().as_bytes().to_vec(), LOCAL_ID.to_vec());

        let events = connection.on_data(&own.as_bytes());

        assert!(matches!(events[0], PeerEvent::ProtocolViolation(_)));
        assert!(connection.is_closed());
        assert!(connection.is_self_connection());
    }

    #[test]
    fn test_message_parsing_after_handshake() {
        let mut connection = ready_connection();

        let mut wire = Vec::new();
        wire.extend(Message::new(MessageId::Unchoke, vec![]).as_bytes());
        wire.extend(Message::new(MessageId::Have, 5u32.to_be_bytes().to_vec()).as_bytes());
        wire.extend(Message::keep_alive_bytes());

        let events = connection.on_data(&wire);

        assert_eq!(
            events,
            vec![
                PeerEvent::Unchoked,
                PeerEvent::Have(5),
                PeerEvent::KeepAlive
            ]
        );
        assert!(!connection.peer_choking);
    }

    #[test]
    fn test_partial_frames_accumulate() {
        let mut connection = ready_connection();
        let bytes = Message::new(MessageId::Have, 3u32.to_be_bytes().to_vec()).as_bytes();

        assert!(connection.on_data(&bytes[..3]).is_empty());
        assert!(connection.on_data(&bytes[3..6]).is_empty());
        let events = connection.on_data(&bytes[6..]);
        assert_eq!(events, vec![PeerEvent::Have(3)]);
    }

    #[test]
    fn test_oversized_message_closes() {
        let mut connection = ready_connection();
        let length = (MAX_MESSAGE_LENGTH + 1).to_be_bytes();

        let events = connection.on_data(&length);

        assert!(matches!(events[0], PeerEvent::ProtocolViolation(_)));
        assert!(connection.is_closed());
    }

    #[test]
    fn test_piece_event_counts_payload() {
        let mut connection = ready_connection();
        let mut payload = Vec::new();
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        payload.extend(vec![0xaa; 1000]);

        let events = connection.on_data(&Message::new(MessageId::Piece, payload).as_bytes());

        assert!(matches!(
            events[0],
            PeerEvent::BlockReceived { piece: 0, begin: 0, ref data } if data.len() == 1000
        ));
        assert_eq!(connection.payload_received(), 1000);
    }

    #[test]
    fn test_extension_handshake_moves_to_ready() {
        let mut connection = ready_connection();
        assert_eq!(connection.state(), WireState::Extended);

        let remote_handshake = ExtensionHandshake::local(6881, Some(100));
        let mut payload = vec![0u8];
        payload.extend(remote_handshake.encode());
        let events =
            connection.on_data(&Message::new(MessageId::Extended, payload).as_bytes());

        assert_eq!(events, vec![PeerEvent::ExtensionHandshakeReceived]);
        assert_eq!(connection.state(), WireState::Ready);
        assert_eq!(connection.remote_metadata_size(), Some(100));
        assert_eq!(connection.remote_extension_id(UT_METADATA), Some(1));
    }

    #[test]
    fn test_unknown_extension_id_closes() {
        let mut connection = ready_connection();

        let events =
            connection.on_data(&Message::new(MessageId::Extended, vec![99]).as_bytes());

        assert!(matches!(events[0], PeerEvent::ProtocolViolation(_)));
        assert!(connection.is_closed());
    }

    #[test]
    fn test_cancel_annihilates_queued_request() {
        let mut connection = ready_connection();
        connection.take_sendable(None);
        connection.queue_request(Request::new(1, 0, 16384));

        connection.queue_cancel(Request::new(1, 0, 16384));

        assert_eq!(connection.queued_frames(), 0);
        assert!(connection.take_sendable(None).is_empty());
    }

    #[test]
    fn test_cancel_overtakes_other_queued_requests() {
        let mut connection = ready_connection();
        connection.take_sendable(None);
        connection.queue_request(Request::new(1, 0, 16384));

        // request for (2,0) was already sent earlier; its cancel arrives now
        connection.queue_cancel(Request::new(2, 0, 16384));

        let bytes = connection.take_sendable(None);
        // first frame on the wire is the cancel (type 8), then the request
        assert_eq!(bytes[4], 8);
        let second_frame = &bytes[17..];
        assert_eq!(second_frame[4], 6);
    }

    #[test]
    fn test_incoming_cancel_drops_queued_piece() {
        let mut connection = ready_connection();
        connection.take_sendable(None);
        connection.queue_piece(4, 16384, &[1, 2, 3]);
        assert_eq!(connection.queued_frames(), 1);

        let mut cancel_payload = Vec::new();
        cancel_payload.extend(4u32.to_be_bytes());
        cancel_payload.extend(16384u32.to_be_bytes());
        cancel_payload.extend(3u32.to_be_bytes());
        connection.on_data(&Message::new(MessageId::Cancel, cancel_payload).as_bytes());

        assert_eq!(connection.queued_frames(), 0);
    }

    #[test]
    fn test_piece_frame_defers_without_tokens() {
        let mut connection = ready_connection();
        connection.take_sendable(None);
        let bucket = TokenBucket::new(1); // effectively empty after 2 tokens

        connection.queue_piece(0, 0, &[0u8; 1000]);
        connection.queue_have(3);

        let sent = connection.take_sendable(Some(&bucket));
        // nothing flows: the piece lacks tokens and the have stays behind it
        assert!(sent.is_empty());
        assert_eq!(connection.queued_frames(), 2);

        // without a bucket the queue drains in order
        let free = connection.take_sendable(None);
        assert_eq!(free[4], 7);
        assert_eq!(connection.payload_sent(), 1000);
    }

    #[test]
    fn test_choke_flags_and_messages() {
        let mut connection = ready_connection();
        connection.take_sendable(None);

        connection.set_am_interested(true);
        connection.set_am_interested(true); // idempotent, queues once
        connection.set_am_choking(false);

        let bytes = connection.take_sendable(None);
        assert_eq!(bytes[4], 2); // interested
        assert_eq!(bytes[9], 1); // unchoke
        assert_eq!(bytes.len(), 10);
    }

    // Auxiliary functions

    fn hash() -> InfoHash {
        InfoHash::new([0xab; 20])
    }

    // a connection that has completed the plain handshake with an
    // extension-capable peer
    fn ready_connection() -> PeerConnection {
        let mut connection = PeerConnection::outgoing(1, LOCAL_ID, hash());
        let remote = Handshake::new(hash().as_bytes().to_vec(), REMOTE_ID.to_vec());
        connection.on_data(&remote.as_bytes());
        connection
    }
}
