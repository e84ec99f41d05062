//! Bucket geometry: how the 32×32 slot grid is split into buckets.
//!
//! A grid of size `g` cuts the region into `g × g` buckets of
//! `(32 / g) × (32 / g)` slots each. Buckets are numbered `bx * g + bz`;
//! inside a bucket slots are visited X-offset outer, Z-offset inner, which is
//! the order their records appear in the encoded bucket.

use crate::coords::REGION_SIZE;
use crate::error::FormatError;

/// A validated bucket grid size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grid {
    size: u8,
}

impl Grid {
    /// Validates `size` as a power of two dividing 32.
    pub fn new(size: u8) -> Result<Self, FormatError> {
        if matches!(size, 1 | 2 | 4 | 8 | 16 | 32) {
            Ok(Self { size })
        } else {
            Err(FormatError::InvalidGridSize(size))
        }
    }

    /// Buckets per axis.
    pub fn size(self) -> u8 {
        self.size
    }

    /// Slots per bucket axis.
    pub fn side(self) -> usize {
        REGION_SIZE as usize / self.size as usize
    }

    /// Total number of buckets.
    pub fn bucket_count(self) -> usize {
        self.size as usize * self.size as usize
    }

    /// Slots held by each bucket.
    pub fn slots_per_bucket(self) -> usize {
        self.side() * self.side()
    }

    /// Bucket containing slot `index`.
    pub fn bucket_of(self, index: usize) -> usize {
        let x = index % REGION_SIZE as usize;
        let z = index / REGION_SIZE as usize;
        let side = self.side();
        (x / side) * self.size as usize + z / side
    }

    /// Slot indices of `bucket` in encoding order.
    pub fn slots(self, bucket: usize) -> impl Iterator<Item = usize> {
        let size = self.size as usize;
        let side = self.side();
        let (bx, bz) = (bucket / size, bucket % size);
        (0..side).flat_map(move |cx| {
            (0..side).map(move |cz| (bx * side + cx) + (bz * side + cz) * REGION_SIZE as usize)
        })
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self { size: 8 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::{CHUNKS_PER_REGION, ChunkPos};

    #[test]
    fn test_rejects_non_dividing_sizes() {
        for bad in [0u8, 3, 5, 12, 64] {
            assert!(matches!(Grid::new(bad), Err(FormatError::InvalidGridSize(b)) if b == bad));
        }
    }

    #[test]
    fn test_every_slot_in_exactly_one_bucket() {
        for size in [1u8, 2, 4, 8, 16, 32] {
            let grid = Grid::new(size).unwrap();
            let mut seen = vec![0u8; CHUNKS_PER_REGION];
            for bucket in 0..grid.bucket_count() {
                let slots: Vec<_> = grid.slots(bucket).collect();
                assert_eq!(slots.len(), grid.slots_per_bucket());
                for slot in slots {
                    assert_eq!(grid.bucket_of(slot), bucket, "grid {size}, slot {slot}");
                    seen[slot] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1), "grid {size} does not partition the region");
        }
    }

    #[test]
    fn test_bucket_order_is_x_major() {
        let grid = Grid::new(8).unwrap();
        // Chunk (3,3) sits in bucket (0,0); chunk (4,0) in bucket (1,0) = index 8.
        assert_eq!(grid.bucket_of(ChunkPos::new(3, 3).local_index()), 0);
        assert_eq!(grid.bucket_of(ChunkPos::new(4, 0).local_index()), 8);
        assert_eq!(grid.bucket_of(ChunkPos::new(0, 4).local_index()), 1);

        let first: Vec<_> = grid.slots(0).take(5).collect();
        // cz varies fastest: (0,0), (0,1), (0,2), (0,3), then (1,0).
        assert_eq!(first, vec![0, 32, 64, 96, 1]);
    }
}
