//! Bucketed, compressed, crash-safe region files.
//!
//! A region stores up to 1024 chunk payloads on a 32×32 grid. Payloads are kept
//! LZ4-compressed in memory and zstd-compressed on disk in checksummed buckets.
//! Mutations are applied in memory immediately; a per-region background worker
//! persists dirty regions by atomically replacing the file.

pub mod bitmap;
pub mod codec;
pub mod coords;
pub mod error;
pub mod format;
pub mod grid;
pub mod region;
pub mod scheduler;
pub mod slot;
pub mod store;
pub mod world;

pub use bitmap::ExistenceBitmap;
pub use codec::{BucketCodec, Codec, DiskCodec, MemoryCodec, content_hash};
pub use coords::{CHUNKS_PER_REGION, ChunkPos, REGION_SIZE};
pub use error::{CodecError, FormatError, RegionError, WorldError};
pub use format::Feature;
pub use grid::Grid;
pub use region::{RegionFile, RegionOptions};
pub use scheduler::{FlushContext, FlushPermit};
pub use slot::ChunkSlot;
pub use store::ChunkStore;
pub use world::{AlwaysEnabled, Dimension, Liveness, WorldRoot, WorldStore, parse_region_name};
