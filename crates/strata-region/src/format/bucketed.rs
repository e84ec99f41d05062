//! Bucketed layout (version 3).
//!
//! | Size | Field |
//! |------|-------|
//! | 8 | Superblock |
//! | 1 | Version (3) |
//! | 8 | Newest timestamp (informational) |
//! | 1 | Grid size |
//! | 4 | Region X |
//! | 4 | Region Z |
//! | 128 | Existence bitmap |
//! | … | Features: `{len: u8, name, value: i32}`, terminated by `len == 0` |
//! | g²×13 | Bucket table: `{length: i32, level: u8, hash: u64}` |
//! | … | Non-empty bucket blobs in grid order |
//! | 8 | Footer superblock |

use std::io::{self, Write};

use crate::bitmap::{BITMAP_BYTES, ExistenceBitmap};
use crate::codec::content_hash;
use crate::error::FormatError;
use crate::format::{BUCKETED_VERSION, ByteReader, Feature, SUPERBLOCK, SUPERBLOCK_LEN};
use crate::grid::Grid;

/// Longest feature name a header can carry.
pub const MAX_FEATURE_NAME: usize = u8::MAX as usize;

/// Everything in a version-3 file before the bucket table.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionHeader {
    /// Newest chunk timestamp in the file.
    pub newest_timestamp: i64,
    /// Bucket grid.
    pub grid: Grid,
    /// Region X coordinate.
    pub region_x: i32,
    /// Region Z coordinate.
    pub region_z: i32,
    /// Slot occupancy.
    pub bitmap: ExistenceBitmap,
    /// Named extensions.
    pub features: Vec<Feature>,
}

/// A compressed bucket exactly as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBucket {
    /// zstd-compressed slot records.
    pub bytes: Vec<u8>,
    /// zstd level recorded in the bucket table.
    pub level: u8,
    /// Content hash recorded in the bucket table.
    pub hash: u64,
}

impl StoredBucket {
    /// Wraps freshly encoded bytes, computing their hash.
    pub fn new(bytes: Vec<u8>, level: u8) -> Self {
        let hash = content_hash(&bytes);
        Self { bytes, level, hash }
    }

    /// Checks the stored bytes against the recorded hash.
    pub fn verify(&self, bucket: usize) -> Result<(), FormatError> {
        let actual = content_hash(&self.bytes);
        if actual != self.hash {
            return Err(FormatError::HashMismatch {
                bucket,
                expected: self.hash,
                actual,
            });
        }
        Ok(())
    }
}

/// A parsed version-3 file. Bucket hashes are not yet verified.
#[derive(Debug)]
pub struct BucketedRegion {
    /// File header.
    pub header: RegionHeader,
    /// One entry per bucket; `None` for empty buckets.
    pub buckets: Vec<Option<StoredBucket>>,
}

/// Parses a version-3 file; `data` starts at the leading superblock.
pub fn parse(data: &[u8]) -> Result<BucketedRegion, FormatError> {
    let mut reader = ByteReader::new(data);
    reader.skip(SUPERBLOCK_LEN + 1)?;

    let newest_timestamp = reader.i64()?;
    let grid = Grid::new(reader.u8()?)?;
    let region_x = reader.i32()?;
    let region_z = reader.i32()?;
    let bitmap = ExistenceBitmap::from_bytes(reader.array::<BITMAP_BYTES>()?);

    let mut features = Vec::new();
    loop {
        let name_len = reader.u8()? as usize;
        if name_len == 0 {
            break;
        }
        let name = reader.bytes(name_len)?.to_vec();
        let value = reader.i32()?;
        features.push(Feature { name, value });
    }

    let mut table = Vec::with_capacity(grid.bucket_count());
    for bucket in 0..grid.bucket_count() {
        let length = reader.i32()?;
        if length < 0 {
            return Err(FormatError::NegativeLength { bucket, length });
        }
        let level = reader.u8()?;
        let hash = reader.u64()?;
        table.push((length as usize, level, hash));
    }

    let mut buckets = Vec::with_capacity(table.len());
    for (length, level, hash) in table {
        if length == 0 {
            buckets.push(None);
            continue;
        }
        let bytes = reader.bytes(length)?.to_vec();
        buckets.push(Some(StoredBucket { bytes, level, hash }));
    }

    let footer = reader.u64()?;
    if footer != SUPERBLOCK {
        return Err(FormatError::InvalidFooter(footer));
    }
    if reader.remaining() != 0 {
        return Err(FormatError::LengthMismatch {
            expected: reader.position() as u64,
            actual: data.len() as u64,
        });
    }

    Ok(BucketedRegion {
        header: RegionHeader {
            newest_timestamp,
            grid,
            region_x,
            region_z,
            bitmap,
            features,
        },
        buckets,
    })
}

/// Writes a complete version-3 file.
///
/// `empty_level` is recorded in the table entries of empty buckets.
pub fn write<W: Write>(
    out: &mut W,
    header: &RegionHeader,
    buckets: &[Option<&StoredBucket>],
    empty_level: u8,
) -> io::Result<()> {
    if buckets.len() != header.grid.bucket_count() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} buckets supplied for a grid of {}",
                buckets.len(),
                header.grid.bucket_count()
            ),
        ));
    }

    out.write_all(&SUPERBLOCK.to_be_bytes())?;
    out.write_all(&[BUCKETED_VERSION])?;
    out.write_all(&header.newest_timestamp.to_be_bytes())?;
    out.write_all(&[header.grid.size()])?;
    out.write_all(&header.region_x.to_be_bytes())?;
    out.write_all(&header.region_z.to_be_bytes())?;
    out.write_all(header.bitmap.as_bytes())?;

    for feature in &header.features {
        let name = &feature.name;
        let len = u8::try_from(name.len()).ok().filter(|len| *len > 0).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("feature name of {} bytes must be 1..={MAX_FEATURE_NAME}", name.len()),
            )
        })?;
        out.write_all(&[len])?;
        out.write_all(name)?;
        out.write_all(&feature.value.to_be_bytes())?;
    }
    out.write_all(&[0])?;

    for bucket in buckets {
        let (length, level, hash) = match bucket {
            Some(stored) => {
                let length = i32::try_from(stored.bytes.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "bucket exceeds 2 GiB")
                })?;
                (length, stored.level, stored.hash)
            }
            None => (0, empty_level, 0),
        };
        out.write_all(&length.to_be_bytes())?;
        out.write_all(&[level])?;
        out.write_all(&hash.to_be_bytes())?;
    }

    for stored in buckets.iter().flatten() {
        out.write_all(&stored.bytes)?;
    }

    out.write_all(&SUPERBLOCK.to_be_bytes())
}
