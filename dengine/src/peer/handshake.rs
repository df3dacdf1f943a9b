#[derive(Debug)]
pub enum FromHandshakeError {
    InvalidHandshake,
}

/// Wire length of a handshake.
pub const HANDSHAKE_LENGTH: usize = 68;

const PSTR: &str = "BitTorrent protocol";
// reserved bit 20, counted from the right of the 64-bit field (BEP-10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Represents a handshake message.
/// Is the first message sent to start a connection with a peer.
#[derive(Debug)]
pub struct Handshake {
    pub pstrlen: u8,
    pub pstr: String,
    pub reserved: [u8; 8],
    pub info_hash: Vec<u8>,
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Creates a new `Handshake` message advertising extension support.
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Self {
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            pstrlen: 19,
            pstr: PSTR.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote set the BEP-10 extension bit.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Converts a `Handshake` message to a byte array.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.pstrlen];
        bytes.extend(self.pstr.as_bytes());
        bytes.extend(&self.reserved);
        bytes.extend(&self.info_hash);
        bytes.extend(&self.peer_id);
        bytes
    }

    /// Parses a byte array into a `Handshake` message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromHandshakeError> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        let pstrlen = bytes[0];
        if pstrlen != 19 {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        let pstr = String::from_utf8(bytes[1..pstrlen as usize + 1].to_vec())
            .map_err(|_| FromHandshakeError::InvalidHandshake)?;
        if pstr != PSTR {
            return Err(FromHandshakeError::InvalidHandshake);
        }
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let info_hash = &bytes[28..48];
        let peer_id = &bytes[48..];

        Ok(Self {
            pstrlen,
            pstr,
            reserved,
            info_hash: info_hash.to_vec(),
            peer_id: peer_id.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_bytes() {
        let expected_handshake_len = 68;
        let expected_pstrlen = 19;
        let expected_pstr = b"BitTorrent protocol".to_vec();

        let info_hash: Vec<u8> = (1..=20).collect();
        let peer_id: Vec<u8> = (21..=40).collect();
        let handshake = Handshake::new(info_hash.clone(), peer_id.clone());

        let bytes = handshake.as_bytes();

        assert_eq!(bytes.len(), expected_handshake_len);
        assert_eq!(bytes[0], expected_pstrlen);
        assert_eq!(bytes[1..20], expected_pstr);
        assert_eq!(bytes[20..28], [0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert_eq!(bytes[28..48], info_hash);
        assert_eq!(bytes[48..], peer_id);
    }

    #[test]
    fn test_from_bytes() {
        let info_hash: Vec<u8> = (1..=20).collect();
        let peer_id: Vec<u8> = (21..=40).collect();
        let handshake = Handshake::new(info_hash.clone(), peer_id.clone());
        let bytes = handshake.as_bytes();

        let handshake = Handshake::from_bytes(&bytes).unwrap();

        assert_eq!(handshake.pstrlen, 19);
        assert_eq!(handshake.pstr, "BitTorrent protocol");
        assert!(handshake.supports_extensions());
        assert_eq!(handshake.info_hash, info_hash);
        assert_eq!(handshake.peer_id, peer_id);
    }

    #[test]
    fn test_from_bytes_without_extension_bit() {
        let info_hash: Vec<u8> = (1..=20).collect();
        let peer_id: Vec<u8> = (21..=40).collect();
        let mut bytes = Handshake::new(info_hash, peer_id).as_bytes();
        bytes[25] = 0;

        let handshake = Handshake::from_bytes(&bytes).unwrap();
        assert!(!handshake.supports_extensions());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Handshake::from_bytes(&[0; 67]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_protocol() {
        let mut bytes = Handshake::new(vec![0; 20], vec![0; 20]).as_bytes();
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
