//! Backend-neutral chunk storage interface.

use crate::coords::ChunkPos;
use crate::error::RegionError;
use crate::region::RegionFile;

/// Per-chunk access to one region's storage.
///
/// Consumers that only read, write and clear chunks (visit tracking,
/// retention passes, unload paths) should depend on this trait rather than on
/// [`RegionFile`], so another region backend can stand in.
pub trait ChunkStore: Send + Sync {
    /// Whether the backing storage exists on disk.
    fn exists(&self) -> bool;

    /// Whether `pos` holds a payload.
    fn has_chunk(&self, pos: ChunkPos) -> Result<bool, RegionError>;

    /// The payload of `pos`, or `None` if the slot is empty.
    fn read_chunk(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>, RegionError>;

    /// Replaces the payload of `pos`.
    fn write_chunk(&self, pos: ChunkPos, data: &[u8]) -> Result<(), RegionError>;

    /// Removes the payload of `pos`.
    fn clear_chunk(&self, pos: ChunkPos) -> Result<(), RegionError>;

    /// When `pos` was last written, in seconds since the Unix epoch.
    fn last_modified(&self, pos: ChunkPos) -> Result<Option<i64>, RegionError>;

    /// Persists everything and releases the storage.
    fn close(&self) -> Result<(), RegionError>;
}

impl ChunkStore for RegionFile {
    fn exists(&self) -> bool {
        RegionFile::exists(self)
    }

    fn has_chunk(&self, pos: ChunkPos) -> Result<bool, RegionError> {
        RegionFile::has_chunk(self, pos)
    }

    fn read_chunk(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>, RegionError> {
        RegionFile::read_chunk(self, pos)
    }

    fn write_chunk(&self, pos: ChunkPos, data: &[u8]) -> Result<(), RegionError> {
        RegionFile::write_chunk(self, pos, data)
    }

    fn clear_chunk(&self, pos: ChunkPos) -> Result<(), RegionError> {
        RegionFile::clear_chunk(self, pos)
    }

    fn last_modified(&self, pos: ChunkPos) -> Result<Option<i64>, RegionError> {
        RegionFile::last_modified(self, pos)
    }

    fn close(&self) -> Result<(), RegionError> {
        RegionFile::close(self)
    }
}
