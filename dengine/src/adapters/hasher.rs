use sha1::{Digest, Sha1};

/// Hashing primitive the engine verifies pieces with.
pub trait Hasher: Send + Sync {
    fn sha1(&self, data: &[u8]) -> [u8; 20];
}

/// Default `Hasher` backed by the sha-1 crate.
pub struct Sha1Hasher;

impl Hasher for Sha1Hasher {
    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_of_empty_input() {
        let hasher = Sha1Hasher;
        let hash = hasher.sha1(b"");
        // well-known SHA-1 of the empty string
        assert_eq!(
            hash,
            [
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95,
                0x60, 0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09
            ]
        );
    }

    #[test]
    fn test_sha1_known_vector() {
        let hasher = Sha1Hasher;
        let hash = hasher.sha1(b"abc");
        assert_eq!(
            hash,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }
}
