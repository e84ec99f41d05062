//! Legacy single-blob layout (versions 1 and 2). Read-only.
//!
//! | Size | Field |
//! |------|-------|
//! | 8 | Superblock |
//! | 1 | Version (1 or 2) |
//! | 8 | Newest timestamp |
//! | 1 | Compression level (unused) |
//! | 2 | Chunk count (unused) |
//! | 4 | Compressed blob length `L` |
//! | 8 | Blob hash (unused) |
//! | L | zstd blob |
//! | 8 | Footer superblock |
//!
//! The blob expands to 1024 × `{size: i32, timestamp: i32}` followed by the
//! payloads of every slot with `size > 0`, in slot order. The per-slot
//! timestamps are not trustworthy in this layout and are discarded.

use crate::codec::{Codec, DiskCodec};
use crate::coords::CHUNKS_PER_REGION;
use crate::error::FormatError;
use crate::format::{ByteReader, SUPERBLOCK, SUPERBLOCK_LEN};

/// Bytes before the compressed blob.
pub const HEADER_LEN: usize = 32;

/// A decoded legacy region: raw payloads indexed by slot.
#[derive(Debug)]
pub struct LegacyRegion {
    /// Newest-timestamp field of the header.
    pub newest_timestamp: i64,
    /// One entry per slot; `None` for empty slots.
    pub payloads: Vec<Option<Vec<u8>>>,
}

impl LegacyRegion {
    /// Number of slots holding a payload.
    pub fn present_count(&self) -> usize {
        self.payloads.iter().filter(|p| p.is_some()).count()
    }
}

/// Parses a legacy file; `data` starts at the leading superblock.
pub fn parse(data: &[u8]) -> Result<LegacyRegion, FormatError> {
    let mut reader = ByteReader::new(data);
    reader.skip(SUPERBLOCK_LEN + 1)?;
    let newest_timestamp = reader.i64()?;
    // Compression level and chunk count.
    reader.skip(3)?;
    let blob_len = reader.i32()?;
    let expected = HEADER_LEN as u64 + blob_len.max(0) as u64 + SUPERBLOCK_LEN as u64;
    if blob_len < 0 || data.len() as u64 != expected {
        return Err(FormatError::LengthMismatch {
            expected,
            actual: data.len() as u64,
        });
    }
    // Blob hash.
    reader.skip(8)?;

    let blob = reader.bytes(blob_len as usize)?;
    let footer = reader.u64()?;
    if footer != SUPERBLOCK {
        return Err(FormatError::InvalidFooter(footer));
    }

    let raw = DiskCodec::new(0).decompress(blob, 0)?;
    let mut blob_reader = ByteReader::new(&raw);
    let mut sizes = Vec::with_capacity(CHUNKS_PER_REGION);
    for _ in 0..CHUNKS_PER_REGION {
        sizes.push(blob_reader.i32()?);
        blob_reader.skip(4)?;
    }

    let payloads = sizes
        .into_iter()
        .map(|size| {
            if size > 0 {
                blob_reader.bytes(size as usize).map(|p| Some(p.to_vec()))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LegacyRegion {
        newest_timestamp,
        payloads,
    })
}

/// Builds a legacy file from slot payloads.
#[cfg(test)]
pub(crate) fn encode(payloads: &[Option<Vec<u8>>], version: u8) -> Vec<u8> {
    assert_eq!(payloads.len(), CHUNKS_PER_REGION);

    let mut raw = Vec::new();
    for payload in payloads {
        let size = payload.as_ref().map_or(0, Vec::len) as i32;
        raw.extend_from_slice(&size.to_be_bytes());
        raw.extend_from_slice(&1_600_000_000i32.to_be_bytes());
    }
    for payload in payloads.iter().flatten() {
        raw.extend_from_slice(payload);
    }
    let blob = zstd::stream::encode_all(&raw[..], 1).unwrap();

    let mut out = Vec::new();
    out.extend_from_slice(&SUPERBLOCK.to_be_bytes());
    out.push(version);
    out.extend_from_slice(&1_600_000_000i64.to_be_bytes());
    out.push(1);
    out.extend_from_slice(&(payloads.iter().flatten().count() as i16).to_be_bytes());
    out.extend_from_slice(&(blob.len() as i32).to_be_bytes());
    out.extend_from_slice(&0i64.to_be_bytes());
    out.extend_from_slice(&blob);
    out.extend_from_slice(&SUPERBLOCK.to_be_bytes());
    out
}
