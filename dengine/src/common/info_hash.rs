use std::fmt;
use std::fmt::Write;

/// 20-byte SHA-1 identity of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash(pub [u8; 20]);

/// Possible `InfoHash` parsing errors.
#[derive(Debug, PartialEq)]
pub enum InfoHashError {
    InvalidLength,
    InvalidHex,
    InvalidBase32,
}

impl InfoHash {
    pub fn new(bytes: [u8; 20]) -> InfoHash {
        InfoHash(bytes)
    }

    /// Builds an `InfoHash` from a 20-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<InfoHash, InfoHashError> {
        if bytes.len() != 20 {
            return Err(InfoHashError::InvalidLength);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Ok(InfoHash(hash))
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<InfoHash, InfoHashError> {
        if hex.len() != 40 {
            return Err(InfoHashError::InvalidLength);
        }
        let mut hash = [0u8; 20];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| InfoHashError::InvalidHex)?;
        }
        Ok(InfoHash(hash))
    }

    /// Parses a 32-character base32 string, the alternative magnet encoding.
    pub fn from_base32(encoded: &str) -> Result<InfoHash, InfoHashError> {
        if encoded.len() != 32 {
            return Err(InfoHashError::InvalidLength);
        }
        let mut bits: u64 = 0;
        let mut bit_count = 0;
        let mut out = Vec::with_capacity(20);
        for c in encoded.chars() {
            let value = match c.to_ascii_uppercase() {
                'A'..='Z' => c.to_ascii_uppercase() as u64 - 'A' as u64,
                '2'..='7' => c as u64 - '2' as u64 + 26,
                _ => return Err(InfoHashError::InvalidBase32),
            };
            bits = (bits << 5) | value;
            bit_count += 5;
            if bit_count >= 8 {
                out.push((bits >> (bit_count - 8)) as u8);
                bit_count -= 8;
            }
        }
        InfoHash::from_slice(&out)
    }

    /// Serializes the infohash as lowercase hex.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(40);
        for byte in &self.0 {
            let _ = write!(&mut hex, "{:02x}", byte);
        }
        hex
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
