use std::fmt::Write;

/// Represents a packed set of piece bits.
///
/// The bitfield knows how many pieces it covers, so spare bits in the last
/// byte never count as pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

/// Possible `Bitfield` errors.
#[derive(Debug, PartialEq)]
pub enum BitfieldError {
    InvalidHex,
    LengthMismatch,
}

impl Bitfield {
    /// Creates an all-zero bitfield covering `piece_count` pieces.
    pub fn new(piece_count: usize) -> Bitfield {
        Bitfield {
            bits: vec![0; (piece_count + 7) / 8],
            piece_count,
        }
    }

    /// Builds a bitfield from wire bytes.
    ///
    /// It returns an error if the byte slice is too short for `piece_count`.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Bitfield, BitfieldError> {
        if bytes.len() < (piece_count + 7) / 8 {
            return Err(BitfieldError::LengthMismatch);
        }
        let mut bitfield = Bitfield {
            bits: bytes[..(piece_count + 7) / 8].to_vec(),
            piece_count,
        };
        bitfield.mask_spare_bits();
        Ok(bitfield)
    }

    /// Returns whether the piece with the given index is set.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte = self.bits[index / 8];
        let bit = (byte >> (7 - (index % 8))) & 1;
        bit != 0
    }

    /// Sets the indexth bit to the given value.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit = 1 << (7 - (index % 8));
        if value {
            self.bits[byte_index] |= bit;
        } else {
            self.bits[byte_index] &= !bit;
        }
    }

    /// Returns the number of set pieces.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the number of pieces the bitfield covers.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Returns whether every piece is set.
    pub fn is_complete(&self) -> bool {
        self.piece_count > 0 && self.count() == self.piece_count
    }

    /// Returns whether no piece is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Returns a new bitfield with the bits of `other` cleared.
    ///
    /// Both bitfields must cover the same number of pieces.
    pub fn and_not(&self, other: &Bitfield) -> Result<Bitfield, BitfieldError> {
        if self.piece_count != other.piece_count {
            return Err(BitfieldError::LengthMismatch);
        }
        let bits = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| a & !b)
            .collect();
        Ok(Bitfield {
            bits,
            piece_count: self.piece_count,
        })
    }

    /// Returns the indices set in `self` but not in `other`.
    pub fn diff(&self, other: &Bitfield) -> Vec<usize> {
        (0..self.piece_count)
            .filter(|i| self.get(*i) && !other.get(*i))
            .collect()
    }

    /// Serializes the bitfield as a hex string.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(self.bits.len() * 2);
        for byte in &self.bits {
            // writing into a String cannot fail
            let _ = write!(&mut hex, "{:02x}", byte);
        }
        hex
    }

    /// Rebuilds a bitfield from a hex string produced by `to_hex`.
    pub fn from_hex(hex: &str, piece_count: usize) -> Result<Bitfield, BitfieldError> {
        if hex.len() % 2 != 0 {
            return Err(BitfieldError::InvalidHex);
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| BitfieldError::InvalidHex)?;
            bytes.push(byte);
        }
        Bitfield::from_bytes(&bytes, piece_count)
    }

    /// Returns the wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let bitfield = Bitfield::new(12);
        assert!(bitfield.is_empty());
        assert_eq!(bitfield.count(), 0);
        assert_eq!(bitfield.as_bytes().len(), 2);
    }

    #[test]
    fn test_set_and_get() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0, true);
        bitfield.set(9, true);

        assert!(bitfield.get(0));
        assert!(bitfield.get(9));
        assert!(!bitfield.get(5));
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_get_out_of_range_is_false() {
        let bitfield = Bitfield::new(8);
        assert!(!bitfield.get(100));
    }

    #[test]
    fn test_set_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::new(8);
        bitfield.set(8, true);
        assert_eq!(bitfield.count(), 0);
    }

    #[test]
    fn test_is_complete() {
        let mut bitfield = Bitfield::new(9);
        for i in 0..9 {
            bitfield.set(i, true);
        }
        assert!(bitfield.is_complete());
        bitfield.set(3, false);
        assert!(!bitfield.is_complete());
    }

    #[test]
    fn test_from_bytes_masks_spare_bits() {
        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 9).unwrap();
        assert_eq!(bitfield.count(), 9);
        assert!(bitfield.is_complete());
    }

    #[test]
    fn test_from_bytes_too_short() {
        assert_eq!(
            Bitfield::from_bytes(&[0xff], 9).unwrap_err(),
            BitfieldError::LengthMismatch
        );
    }

    #[test]
    fn test_and_not() {
        let mut owned = Bitfield::new(8);
        owned.set(1, true);
        owned.set(2, true);
        let mut parts = Bitfield::new(8);
        parts.set(2, true);

        let advertised = owned.and_not(&parts).unwrap();

        assert!(advertised.get(1));
        assert!(!advertised.get(2));
        assert_eq!(advertised.count(), 1);
    }

    #[test]
    fn test_diff() {
        let mut a = Bitfield::new(16);
        a.set(0, true);
        a.set(1, true);
        a.set(9, true);
        let mut b = Bitfield::new(16);
        b.set(1, true);

        assert_eq!(a.diff(&b), vec![0, 9]);
        assert_eq!(b.diff(&a), Vec::<usize>::new());
    }

    #[test]
    fn test_hex_roundtrip() {
        let mut bitfield = Bitfield::new(11);
        bitfield.set(0, true);
        bitfield.set(7, true);
        bitfield.set(10, true);

        let hex = bitfield.to_hex();
        let restored = Bitfield::from_hex(&hex, 11).unwrap();

        assert_eq!(restored, bitfield);
    }

    #[test]
    fn test_from_hex_invalid() {
        assert_eq!(
            Bitfield::from_hex("zz", 8).unwrap_err(),
            BitfieldError::InvalidHex
        );
        assert_eq!(
            Bitfield::from_hex("abc", 8).unwrap_err(),
            BitfieldError::InvalidHex
        );
    }
}
