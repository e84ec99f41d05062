//! Versioned on-disk region format.
//!
//! Every region file is bracketed by the same 8-byte superblock. The byte after
//! the leading superblock selects the parser:
//!
//! - versions 1 and 2: [`legacy`], a single zstd blob holding every slot
//! - version 3: [`bucketed`], independently compressed and hashed buckets
//!
//! Only the bucketed format is ever written. All integers are big-endian.

pub mod bucketed;
pub mod legacy;

use crate::error::FormatError;

pub use bucketed::{BucketedRegion, RegionHeader, StoredBucket};
pub use legacy::LegacyRegion;

/// Magic value at the start and end of every region file.
pub const SUPERBLOCK: u64 = 0xc3ff_1318_3cca_9d9a;

/// Version byte written by this engine.
pub const BUCKETED_VERSION: u8 = 3;

/// Size of the superblock in bytes.
pub const SUPERBLOCK_LEN: usize = 8;

/// A named integer extension stored in a version-3 header.
///
/// Readers keep entries they do not understand and write them back unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feature {
    /// Extension name, 1 to 255 raw bytes. Not required to be UTF-8.
    pub name: Vec<u8>,
    /// Extension value.
    pub value: i32,
}

/// A region file parsed into one of the supported layouts.
#[derive(Debug)]
pub enum ParsedRegion {
    /// Version 1 or 2.
    Legacy(LegacyRegion),
    /// Version 3.
    Bucketed(BucketedRegion),
}

/// Parses a complete region file.
pub fn parse(data: &[u8]) -> Result<ParsedRegion, FormatError> {
    let mut reader = ByteReader::new(data);
    let superblock = reader.u64()?;
    if superblock != SUPERBLOCK {
        return Err(FormatError::InvalidSuperblock(superblock));
    }

    match reader.u8()? {
        1 | 2 => legacy::parse(data).map(ParsedRegion::Legacy),
        BUCKETED_VERSION => bucketed::parse(data).map(ParsedRegion::Bucketed),
        version => Err(FormatError::UnsupportedVersion(version)),
    }
}

/// Bounds-checked big-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), FormatError> {
        self.bytes(len).map(|_| ())
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn i32(&mut self) -> Result<i32, FormatError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}
