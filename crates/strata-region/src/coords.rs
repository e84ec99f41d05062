//! Chunk and region addressing.

/// Chunks along one axis of a region.
pub const REGION_SIZE: i32 = 32;

/// Chunk slots held by one region.
pub const CHUNKS_PER_REGION: usize = (REGION_SIZE * REGION_SIZE) as usize;

/// A chunk position on the world's chunk grid.
///
/// Region operations accept either world chunk coordinates or region-local
/// ones; only the low five bits of each axis select the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkPos {
    /// Chunk-grid X coordinate.
    pub x: i32,
    /// Chunk-grid Z coordinate.
    pub z: i32,
}

impl ChunkPos {
    /// Creates a new chunk position.
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Slot index inside the owning region: `localX + localZ * 32`.
    pub fn local_index(self) -> usize {
        ((self.x & 31) + ((self.z & 31) << 5)) as usize
    }

    /// Local position of a slot index.
    pub fn from_local_index(index: usize) -> Self {
        debug_assert!(index < CHUNKS_PER_REGION, "slot index out of range");
        Self {
            x: (index & 31) as i32,
            z: (index >> 5) as i32,
        }
    }

    /// Coordinates of the region containing this chunk.
    pub fn region(self) -> (i32, i32) {
        (self.x >> 5, self.z >> 5)
    }

    /// X offset inside the region (0..32).
    pub fn local_x(self) -> i32 {
        self.x & 31
    }

    /// Z offset inside the region (0..32).
    pub fn local_z(self) -> i32 {
        self.z & 31
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_index_layout() {
        assert_eq!(ChunkPos::new(0, 0).local_index(), 0);
        assert_eq!(ChunkPos::new(31, 0).local_index(), 31);
        assert_eq!(ChunkPos::new(0, 1).local_index(), 32);
        assert_eq!(ChunkPos::new(31, 31).local_index(), 1023);
    }

    #[test]
    fn test_negative_world_coordinates_wrap() {
        let pos = ChunkPos::new(-1, -32);
        assert_eq!(pos.local_x(), 31);
        assert_eq!(pos.local_z(), 0);
        assert_eq!(pos.region(), (-1, -1));
        assert_eq!(pos.local_index(), 31);
    }

    #[test]
    fn test_from_local_index_inverts() {
        for index in [0usize, 1, 33, 512, 1023] {
            assert_eq!(ChunkPos::from_local_index(index).local_index(), index);
        }
    }
}
