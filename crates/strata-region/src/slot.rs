//! In-memory chunk slot.

/// One of the 1024 chunk slots of a region.
///
/// A present slot holds its payload LZ4-compressed together with the
/// original length. `uncompressed_size == 0` means the slot is empty; the
/// timestamp of an empty slot carries no meaning but is kept so that buckets
/// round-trip unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkSlot {
    data: Option<Box<[u8]>>,
    uncompressed_size: u32,
    timestamp: i64,
}

impl ChunkSlot {
    /// An empty slot carrying `timestamp`.
    pub fn empty(timestamp: i64) -> Self {
        Self {
            data: None,
            uncompressed_size: 0,
            timestamp,
        }
    }

    /// A slot holding `compressed` bytes that expand to `uncompressed_size`.
    ///
    /// A zero `uncompressed_size` yields an empty slot.
    pub fn present(compressed: Vec<u8>, uncompressed_size: u32, timestamp: i64) -> Self {
        if uncompressed_size == 0 {
            return Self::empty(timestamp);
        }
        Self {
            data: Some(compressed.into_boxed_slice()),
            uncompressed_size,
            timestamp,
        }
    }

    /// Returns `true` if the slot holds a payload.
    pub fn is_present(&self) -> bool {
        self.uncompressed_size > 0
    }

    /// LZ4-compressed payload, if present.
    pub fn compressed(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Original payload length; 0 when empty.
    pub fn uncompressed_size(&self) -> u32 {
        self.uncompressed_size
    }

    /// Last-modified time in seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Drops the payload and zeroes length and timestamp.
    pub fn clear(&mut self) {
        *self = Self::empty(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_is_empty() {
        let slot = ChunkSlot::present(vec![1, 2, 3], 0, 99);
        assert!(!slot.is_present());
        assert!(slot.compressed().is_none());
        assert_eq!(slot.timestamp(), 99);
    }

    #[test]
    fn test_clear_zeroes_everything() {
        let mut slot = ChunkSlot::present(vec![9; 4], 10, 1_700_000_000);
        assert!(slot.is_present());
        slot.clear();
        assert_eq!(slot, ChunkSlot::default());
    }
}
