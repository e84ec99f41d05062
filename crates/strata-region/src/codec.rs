//! Two-tier chunk compression and bucket encoding.
//!
//! - [`DiskCodec`] (zstd) compresses whole buckets for storage.
//! - [`MemoryCodec`] (LZ4) compresses individual payloads held in memory, so
//!   slots never sit around as raw bytes.
//!
//! ## Bucket layout (before zstd)
//!
//! One record per slot, in [`Grid::slots`](crate::grid::Grid::slots) order:
//!
//! | Size | Field |
//! |------|-------|
//! | 4 | Record length (`i32` BE): payload length + 8, or 0 for an empty slot |
//! | 8 | Timestamp (`i64` BE, seconds since epoch) |
//! | N | Payload (only when the record length is non-zero) |

use crate::error::{CodecError, FormatError};
use crate::format::ByteReader;
use crate::slot::ChunkSlot;

/// Bytes of a slot record counted by its length field besides the payload.
const RECORD_TIMESTAMP_LEN: usize = 8;

/// Largest payload a bucket record can describe.
pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize - RECORD_TIMESTAMP_LEN;

/// Length field of a record holding `payload_len` bytes.
fn record_len(payload_len: usize) -> Result<i32, CodecError> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    i32::try_from(payload_len + RECORD_TIMESTAMP_LEN).map_err(|_| CodecError::PayloadTooLarge {
        len: payload_len,
        max: MAX_PAYLOAD_LEN,
    })
}

/// A compression strategy.
pub trait Codec: Send + Sync {
    /// Compresses `raw`.
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompresses `packed`; `raw_len` is the expected output length when known.
    fn decompress(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError>;
}

/// zstd compression for buckets at rest.
#[derive(Clone, Copy, Debug)]
pub struct DiskCodec {
    level: i32,
}

impl DiskCodec {
    /// Creates a codec compressing at `level`.
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// The zstd level in use.
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Codec for DiskCodec {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::stream::encode_all(raw, self.level).map_err(CodecError::Compress)
    }

    fn decompress(&self, packed: &[u8], _raw_len: usize) -> Result<Vec<u8>, CodecError> {
        zstd::stream::decode_all(packed).map_err(CodecError::Decompress)
    }
}

/// LZ4 block compression for payloads held in memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryCodec;

impl Codec for MemoryCodec {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress(raw))
    }

    fn decompress(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        let raw =
            lz4_flex::decompress(packed, raw_len).map_err(|e| CodecError::Lz4(e.to_string()))?;
        if raw.len() != raw_len {
            return Err(CodecError::Lz4(format!(
                "expanded to {} bytes, expected {raw_len}",
                raw.len()
            )));
        }
        Ok(raw)
    }
}

/// 64-bit content hash (XXH64, seed 0) of a stored bucket.
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(bytes, 0)
}

/// Encodes and decodes buckets, and packs individual slots.
#[derive(Clone, Copy, Debug)]
pub struct BucketCodec {
    disk: DiskCodec,
    memory: MemoryCodec,
}

impl BucketCodec {
    /// Creates a codec whose buckets are compressed at zstd `level`.
    pub fn new(level: i32) -> Self {
        Self {
            disk: DiskCodec::new(level),
            memory: MemoryCodec,
        }
    }

    /// The zstd level new buckets are written with.
    pub fn level(&self) -> i32 {
        self.disk.level()
    }

    /// Compresses a payload into a slot stamped with `timestamp`.
    ///
    /// Payloads over [`MAX_PAYLOAD_LEN`] are rejected.
    pub fn pack_slot(&self, raw: &[u8], timestamp: i64) -> Result<ChunkSlot, CodecError> {
        if raw.is_empty() {
            return Ok(ChunkSlot::empty(timestamp));
        }
        record_len(raw.len())?;
        let compressed = self.memory.compress(raw)?;
        // Bounded by MAX_PAYLOAD_LEN above.
        Ok(ChunkSlot::present(compressed, raw.len() as u32, timestamp))
    }

    /// Expands a slot's payload; `None` if the slot is empty.
    pub fn unpack_slot(&self, slot: &ChunkSlot) -> Result<Option<Vec<u8>>, CodecError> {
        match slot.compressed() {
            Some(data) if slot.is_present() => self
                .memory
                .decompress(data, slot.uncompressed_size() as usize)
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Serializes `slots` and compresses them for disk.
    ///
    /// Returns `None` when no slot holds a payload: empty buckets are not stored.
    pub fn encode_bucket(&self, slots: &[ChunkSlot]) -> Result<Option<Vec<u8>>, CodecError> {
        if !slots.iter().any(ChunkSlot::is_present) {
            return Ok(None);
        }

        let payload_total: usize = slots.iter().map(|s| s.uncompressed_size() as usize).sum();
        let mut raw = Vec::with_capacity(payload_total + slots.len() * 12);
        for slot in slots {
            match self.unpack_slot(slot)? {
                Some(payload) => {
                    raw.extend_from_slice(&record_len(payload.len())?.to_be_bytes());
                    raw.extend_from_slice(&slot.timestamp().to_be_bytes());
                    raw.extend_from_slice(&payload);
                }
                None => {
                    raw.extend_from_slice(&0i32.to_be_bytes());
                    raw.extend_from_slice(&slot.timestamp().to_be_bytes());
                }
            }
        }

        self.disk.compress(&raw).map(Some)
    }

    /// Decompresses bucket `bucket` and re-packs its `slot_count` payloads for memory.
    pub fn decode_bucket(
        &self,
        bucket: usize,
        bytes: &[u8],
        slot_count: usize,
    ) -> Result<Vec<ChunkSlot>, FormatError> {
        let raw = self.disk.decompress(bytes, 0)?;
        let malformed = |reason: String| FormatError::MalformedBucket { bucket, reason };

        let mut reader = ByteReader::new(&raw);
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let record_len = reader.i32().map_err(|e| malformed(e.to_string()))?;
            let timestamp = reader.i64().map_err(|e| malformed(e.to_string()))?;
            if record_len == 0 {
                slots.push(ChunkSlot::empty(timestamp));
                continue;
            }
            if record_len < RECORD_TIMESTAMP_LEN as i32 {
                return Err(malformed(format!("record length {record_len} is too small")));
            }
            let payload = reader
                .bytes(record_len as usize - RECORD_TIMESTAMP_LEN)
                .map_err(|e| malformed(e.to_string()))?;
            slots.push(self.pack_slot(payload, timestamp)?);
        }

        if reader.remaining() != 0 {
            return Err(malformed(format!(
                "{} trailing bytes after {slot_count} records",
                reader.remaining()
            )));
        }
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_slots(codec: &BucketCodec) -> Vec<ChunkSlot> {
        vec![
            codec.pack_slot(&[7u8; 300], 1_700_000_001).unwrap(),
            ChunkSlot::empty(42),
            codec.pack_slot(b"hello region", 1_700_000_002).unwrap(),
            ChunkSlot::empty(0),
        ]
    }

    #[test]
    fn test_memory_codec_restores_payload() {
        let codec = MemoryCodec;
        let raw: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        let packed = codec.compress(&raw).unwrap();
        assert!(packed.len() < raw.len());
        assert_eq!(codec.decompress(&packed, raw.len()).unwrap(), raw);
    }

    #[test]
    fn test_memory_codec_rejects_wrong_length() {
        let codec = MemoryCodec;
        let packed = codec.compress(&[1u8; 64]).unwrap();
        assert!(codec.decompress(&packed, 65).is_err());
    }

    #[test]
    fn test_bucket_roundtrip_keeps_timestamps_of_empty_slots() {
        let codec = BucketCodec::new(3);
        let slots = sample_slots(&codec);
        let encoded = codec.encode_bucket(&slots).unwrap().expect("bucket has data");
        let decoded = codec.decode_bucket(0, &encoded, slots.len()).unwrap();

        assert_eq!(decoded.len(), 4);
        assert_eq!(codec.unpack_slot(&decoded[0]).unwrap().unwrap(), vec![7u8; 300]);
        assert_eq!(decoded[0].timestamp(), 1_700_000_001);
        assert!(!decoded[1].is_present());
        assert_eq!(decoded[1].timestamp(), 42);
        assert_eq!(codec.unpack_slot(&decoded[2]).unwrap().unwrap(), b"hello region");
    }

    #[test]
    fn test_record_length_counts_timestamp() {
        let codec = BucketCodec::new(1);
        let slots = vec![codec.pack_slot(&[1, 2, 3], 5).unwrap()];
        let encoded = codec.encode_bucket(&slots).unwrap().unwrap();
        let raw = zstd::stream::decode_all(&encoded[..]).unwrap();
        assert_eq!(&raw[..4], &11i32.to_be_bytes());
        assert_eq!(&raw[4..12], &5i64.to_be_bytes());
        assert_eq!(&raw[12..], &[1, 2, 3]);
    }

    #[test]
    fn test_record_length_limit() {
        assert_eq!(record_len(0).unwrap(), 8);
        assert_eq!(record_len(MAX_PAYLOAD_LEN).unwrap(), i32::MAX);
        assert!(matches!(
            record_len(MAX_PAYLOAD_LEN + 1),
            Err(CodecError::PayloadTooLarge { .. })
        ));
        // Lengths past u32 must not wrap into a small record.
        assert!(matches!(
            record_len(u32::MAX as usize + 9),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_bucket_is_not_encoded() {
        let codec = BucketCodec::new(1);
        let slots = vec![ChunkSlot::empty(10); 16];
        assert!(codec.encode_bucket(&slots).unwrap().is_none());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = BucketCodec::new(1);
        let slots = sample_slots(&codec);
        let a = codec.encode_bucket(&slots).unwrap().unwrap();
        let b = codec.encode_bucket(&slots).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_content() {
        assert_ne!(content_hash(b"bucket a"), content_hash(b"bucket b"));
        // Reference value of XXH64 for empty input with seed 0.
        assert_eq!(content_hash(b""), 0xef46_db37_51d8_e999);
    }

    #[test]
    fn test_decode_rejects_short_record() {
        let codec = BucketCodec::new(1);
        let mut raw = Vec::new();
        raw.extend_from_slice(&4i32.to_be_bytes());
        raw.extend_from_slice(&0i64.to_be_bytes());
        let encoded = zstd::stream::encode_all(&raw[..], 1).unwrap();
        let err = codec.decode_bucket(3, &encoded, 1).unwrap_err();
        assert!(matches!(err, FormatError::MalformedBucket { bucket: 3, .. }));
    }

    #[test]
    fn test_decode_rejects_missing_records() {
        let codec = BucketCodec::new(1);
        let slots = sample_slots(&codec);
        let encoded = codec.encode_bucket(&slots).unwrap().unwrap();
        assert!(codec.decode_bucket(0, &encoded, 5).is_err());
        assert!(codec.decode_bucket(0, &encoded, 3).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = BucketCodec::new(1);
        let err = codec.decode_bucket(0, b"definitely not zstd", 1).unwrap_err();
        assert!(matches!(err, FormatError::Codec(CodecError::Decompress(_))));
    }
}
