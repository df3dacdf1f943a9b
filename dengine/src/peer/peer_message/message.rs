// IDs of the messages defined in the protocol.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

/// A framed wire message: the type byte and its payload.
///
/// The 4-byte length prefix is handled by the connection's framing; a
/// zero-length frame (keep-alive) never reaches this type.
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum MessageError {
    InvalidMessage,
    ShortPayload(MessageId),
}

impl Message {
    /// Creates a new `Message` from a message ID and a payload.
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Parses a frame body (type byte plus payload) into a `Message`.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.is_empty() {
            return Err(MessageError::InvalidMessage);
        }
        let id = match payload[0] {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            20 => MessageId::Extended,
            _ => return Err(MessageError::InvalidMessage),
        };

        let msg_payload = if payload.len() > 1 {
            payload[1..].to_vec()
        } else {
            vec![]
        };

        Ok(Self {
            id,
            payload: msg_payload,
        })
    }

    /// Converts a `Message` to a byte array with its length prefix.
    pub fn as_bytes(&self) -> Vec<u8> {
        let len = self.payload.len() + 1;
        let len_bytes: [u8; 4] = (len as u32).to_be_bytes();
        let mut bytes = vec![0; 4 + len];
        bytes[0..4].copy_from_slice(&len_bytes);
        bytes[4] = self.id as u8;
        bytes[5..].copy_from_slice(&self.payload);
        bytes
    }

    /// The wire bytes of a keep-alive: a bare zero length prefix.
    pub fn keep_alive_bytes() -> Vec<u8> {
        vec![0, 0, 0, 0]
    }

    /// Reads the piece index of a `Have` payload.
    pub fn parse_have(payload: &[u8]) -> Result<u32, MessageError> {
        if payload.len() < 4 {
            return Err(MessageError::ShortPayload(MessageId::Have));
        }
        Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
    }

    /// Reads `(index, begin, length)` of a `Request` or `Cancel` payload.
    pub fn parse_request(payload: &[u8]) -> Result<(u32, u32, u32), MessageError> {
        if payload.len() < 12 {
            return Err(MessageError::ShortPayload(MessageId::Request));
        }
        let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let length = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        Ok((index, begin, length))
    }

    /// Reads `(index, begin, block)` of a `Piece` payload.
    pub fn parse_piece(payload: &[u8]) -> Result<(u32, u32, &[u8]), MessageError> {
        if payload.len() < 8 {
            return Err(MessageError::ShortPayload(MessageId::Piece));
        }
        let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok((index, begin, &payload[8..]))
    }

    /// Reads the port of a `Port` payload.
    pub fn parse_port(payload: &[u8]) -> Result<u16, MessageError> {
        if payload.len() < 2 {
            return Err(MessageError::ShortPayload(MessageId::Port));
        }
        Ok(u16::from_be_bytes([payload[0], payload[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_unchoke_from_bytes() {
        let payload = 1u8.to_be_bytes();
        let msg = Message::from_bytes(&payload).unwrap();

        assert_eq!(msg.id, MessageId::Unchoke);
        assert_eq!(msg.payload, Vec::<u8>::new());
    }

    #[test]
    fn test_message_extended_from_bytes() {
        let payload = [20u8, 0, b'd', b'e'];
        let msg = Message::from_bytes(&payload).unwrap();

        assert_eq!(msg.id, MessageId::Extended);
        assert_eq!(msg.payload, vec![0, b'd', b'e']);
    }

    #[test]
    fn test_message_unknown_id() {
        assert_eq!(
            Message::from_bytes(&[13u8]).unwrap_err(),
            MessageError::InvalidMessage
        );
    }

    #[test]
    fn test_message_request_as_bytes() {
        let index = 0u32.to_be_bytes();
        let begin = 0u32.to_be_bytes();
        let length = 16384u32.to_be_bytes();
        let payload = [index, begin, length].concat();
        let msg = Message::new(MessageId::Request, payload.clone());

        let bytes = msg.as_bytes();

        let len = 13u32.to_be_bytes();
        let msg_type = 6u8.to_be_bytes();
        let mut expected: Vec<u8> = vec![];
        expected.extend(&len);
        expected.extend(&msg_type);
        expected.extend(&payload);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_message_interested_as_bytes() {
        let msg = Message::new(MessageId::Interested, vec![]);

        let bytes = msg.as_bytes();

        let len = 1u32.to_be_bytes();
        let msg_type = 2u8.to_be_bytes();
        let mut expected: Vec<u8> = vec![];
        expected.extend(&len);
        expected.extend(&msg_type);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_keep_alive_bytes() {
        assert_eq!(Message::keep_alive_bytes(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_have() {
        assert_eq!(Message::parse_have(&7u32.to_be_bytes()).unwrap(), 7);
        assert!(Message::parse_have(&[0, 0]).is_err());
    }

    #[test]
    fn test_parse_request() {
        let mut payload = vec![];
        payload.extend(3u32.to_be_bytes());
        payload.extend(16384u32.to_be_bytes());
        payload.extend(1000u32.to_be_bytes());

        assert_eq!(Message::parse_request(&payload).unwrap(), (3, 16384, 1000));
        assert!(Message::parse_request(&payload[..8]).is_err());
    }

    #[test]
    fn test_parse_piece() {
        let mut payload = vec![];
        payload.extend(3u32.to_be_bytes());
        payload.extend(16384u32.to_be_bytes());
        payload.extend([9, 9, 9]);

        let (index, begin, block) = Message::parse_piece(&payload).unwrap();
        assert_eq!(index, 3);
        assert_eq!(begin, 16384);
        assert_eq!(block, &[9, 9, 9]);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(Message::parse_port(&6881u16.to_be_bytes()).unwrap(), 6881);
    }
}
