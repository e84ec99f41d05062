//! Error types for region storage.
//!
//! Absence is not an error: a missing region file or an empty slot is reported
//! through `Ok(false)` / `Ok(None)`. Everything here means the caller asked for
//! something the engine could not do, or found data it cannot trust.

use std::path::PathBuf;

/// Structural problems found while parsing or decoding a region file.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The leading superblock does not match.
    #[error("invalid superblock {0:#018x}")]
    InvalidSuperblock(u64),
    /// The trailing superblock does not match, usually a truncated write.
    #[error("invalid footer superblock {0:#018x}")]
    InvalidFooter(u64),
    /// The version byte selects no known parser.
    #[error("unsupported region format version {0}")]
    UnsupportedVersion(u8),
    /// The grid size is not a power of two dividing 32.
    #[error("invalid grid size {0}")]
    InvalidGridSize(u8),
    /// The data ends before a field could be read.
    #[error("data truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset of the field being read.
        offset: usize,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the input.
        available: usize,
    },
    /// The file length disagrees with the length recorded in its header.
    #[error("file length {actual} does not match expected {expected}")]
    LengthMismatch {
        /// Length implied by the header.
        expected: u64,
        /// Length actually present.
        actual: u64,
    },
    /// A stored bucket does not hash to the value recorded in the bucket table.
    #[error("bucket {bucket} hash mismatch: recorded {expected:#018x}, computed {actual:#018x}")]
    HashMismatch {
        /// Bucket index in grid order.
        bucket: usize,
        /// Hash from the bucket table.
        expected: u64,
        /// Hash of the bytes on disk.
        actual: u64,
    },
    /// A bucket table entry holds a negative byte length.
    #[error("bucket {bucket} has negative length {length}")]
    NegativeLength {
        /// Bucket index in grid order.
        bucket: usize,
        /// The recorded length.
        length: i32,
    },
    /// A bucket decompressed but its slot records are malformed.
    #[error("bucket {bucket} is malformed: {reason}")]
    MalformedBucket {
        /// Bucket index in grid order.
        bucket: usize,
        /// What was wrong.
        reason: String,
    },
    /// Decompression of stored data failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures of the at-rest or in-memory compressor.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// zstd compression failed.
    #[error("zstd compression failed: {0}")]
    Compress(#[source] std::io::Error),
    /// zstd decompression failed.
    #[error("zstd decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Lz4(String),
    /// A payload too large for a bucket record.
    #[error("payload of {len} bytes exceeds the record limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Failures resolving where a world keeps its region data.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// A secondary world reported the default world's folder as its own.
    #[error("cannot determine data directory for world at {0}: it is the default world's folder")]
    AmbiguousRoot(PathBuf),
}

/// Errors surfaced by region and world operations.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// The region file exists but cannot be trusted.
    #[error("region file {path} is corrupt: {source}")]
    Format {
        /// The region file.
        path: PathBuf,
        /// What was wrong with it.
        #[source]
        source: FormatError,
    },
    /// A chunk payload exceeded the configured ceiling; the slot was cleared.
    #[error("chunk payload of {len} bytes exceeds the {max} byte limit")]
    Capacity {
        /// Size of the rejected payload.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A filesystem operation failed.
    #[error("I/O error while {context} {path}: {source}")]
    Io {
        /// What the engine was doing.
        context: &'static str,
        /// The file or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The region was closed; its handle can no longer be used.
    #[error("region file {path} is closed")]
    Closed {
        /// The region file.
        path: PathBuf,
    },
    /// The world's data directory could not be resolved.
    #[error(transparent)]
    World(#[from] WorldError),
}

impl RegionError {
    /// Returns `true` for errors that mean the region's data is corrupt.
    pub fn is_format(&self) -> bool {
        matches!(self, RegionError::Format { .. })
    }

    pub(crate) fn format(path: impl Into<PathBuf>, source: impl Into<FormatError>) -> Self {
        RegionError::Format {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        RegionError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_display_names_path() {
        let err = RegionError::format("world/region/r.0.0.linear", FormatError::UnsupportedVersion(9));
        let msg = err.to_string();
        assert!(msg.contains("r.0.0.linear"));
        assert!(msg.contains("version 9"));
        assert!(err.is_format());
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = RegionError::io("writing", "r.1.1.linear.tmp", io);
        assert!(err.to_string().contains("access denied"));
        assert!(err.source().is_some());
        assert!(!err.is_format());
    }

    #[test]
    fn test_codec_error_converts_into_format_error() {
        let codec = CodecError::Lz4("bad offset".to_string());
        let format: FormatError = codec.into();
        assert!(matches!(format, FormatError::Codec(CodecError::Lz4(_))));
    }
}
