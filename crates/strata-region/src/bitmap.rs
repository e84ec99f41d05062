//! Fixed 1024-bit chunk existence map stored in the region header.
//!
//! Bit `i` is set when slot `i` holds a payload. Bits are packed MSB-first:
//! slot `i` lives in byte `i / 8` at bit `7 - i % 8`.

use crate::coords::CHUNKS_PER_REGION;

/// Serialized size of the bitmap in bytes.
pub const BITMAP_BYTES: usize = CHUNKS_PER_REGION / 8;

/// Occupancy flags for the 1024 slots of a region.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExistenceBitmap {
    bytes: [u8; BITMAP_BYTES],
}

impl ExistenceBitmap {
    /// Creates a bitmap with every slot marked empty.
    pub fn new() -> Self {
        Self {
            bytes: [0; BITMAP_BYTES],
        }
    }

    /// Reconstructs a bitmap from its on-disk bytes.
    pub fn from_bytes(bytes: [u8; BITMAP_BYTES]) -> Self {
        Self { bytes }
    }

    /// The on-disk representation.
    pub fn as_bytes(&self) -> &[u8; BITMAP_BYTES] {
        &self.bytes
    }

    /// Returns whether slot `index` is marked occupied.
    pub fn get(&self, index: usize) -> bool {
        (self.bytes[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Marks slot `index` occupied or empty.
    pub fn set(&mut self, index: usize, present: bool) {
        let mask = 1u8 << (7 - index % 8);
        if present {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterates over the indices of occupied slots in ascending order.
    pub fn iter_present(&self) -> impl Iterator<Item = usize> + '_ {
        (0..CHUNKS_PER_REGION).filter(|&i| self.get(i))
    }
}

impl Default for ExistenceBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExistenceBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceBitmap")
            .field("present", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_bit_order() {
        let mut bitmap = ExistenceBitmap::new();
        bitmap.set(0, true);
        assert_eq!(bitmap.as_bytes()[0], 0b1000_0000);
        bitmap.set(7, true);
        assert_eq!(bitmap.as_bytes()[0], 0b1000_0001);
        bitmap.set(9, true);
        assert_eq!(bitmap.as_bytes()[1], 0b0100_0000);
    }

    #[test]
    fn test_set_then_clear() {
        let mut bitmap = ExistenceBitmap::new();
        bitmap.set(1023, true);
        assert!(bitmap.get(1023));
        assert_eq!(bitmap.count(), 1);
        bitmap.set(1023, false);
        assert!(!bitmap.get(1023));
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_from_bytes_preserves_bits() {
        let mut raw = [0u8; BITMAP_BYTES];
        raw[2] = 0b0010_0000;
        raw[127] = 0b0000_0001;
        let bitmap = ExistenceBitmap::from_bytes(raw);
        let present: Vec<_> = bitmap.iter_present().collect();
        assert_eq!(present, vec![18, 1023]);
    }
}
