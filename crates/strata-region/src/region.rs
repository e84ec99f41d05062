//! A single region file: 1024 chunk slots backed by one bucketed file on disk.
//!
//! ## Lifecycle
//!
//! A [`RegionFile`] is cheap to create and touches nothing until the first
//! chunk operation (or an explicit [`RegionFile::read`]) loads it. Loading
//! parses the file and verifies every bucket hash, but leaves buckets encoded;
//! a bucket is decoded the first time one of its slots is accessed. Loading
//! also starts the region's background flush worker.
//!
//! Mutations apply to memory under the region lock and mark the region dirty.
//! The worker (or [`RegionFile::flush`] / [`RegionFile::close`]) then writes a
//! complete new file beside the target and renames it into place.
//!
//! ## Locking
//!
//! - `state` guards slots, bucket states and header data.
//! - `io_lock` serializes flushes of one region; it is taken before `state`
//!   and held while the file is written, while `state` is only held long
//!   enough to snapshot it.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use strata_config::StorageConfig;

use crate::bitmap::ExistenceBitmap;
use crate::codec::{BucketCodec, MAX_PAYLOAD_LEN};
use crate::coords::{CHUNKS_PER_REGION, ChunkPos};
use crate::error::{FormatError, RegionError};
use crate::format::{self, Feature, ParsedRegion, RegionHeader, StoredBucket, bucketed};
use crate::grid::Grid;
use crate::scheduler::{FlushContext, FlushTarget, FlushTask};
use crate::slot::ChunkSlot;

/// Per-region storage settings.
#[derive(Clone, Copy, Debug)]
pub struct RegionOptions {
    /// Grid used when a region is created. Existing files keep their own.
    pub grid: Grid,
    /// Codec for buckets written by this region.
    pub codec: BucketCodec,
    /// Largest accepted chunk payload in bytes. Values above
    /// [`MAX_PAYLOAD_LEN`] behave as that limit.
    pub max_chunk_size: usize,
}

impl RegionOptions {
    /// Builds options from the storage settings.
    ///
    /// The settings are expected to be validated; an invalid grid size falls
    /// back to the default grid.
    pub fn from_config(config: &StorageConfig) -> Self {
        let grid = Grid::new(config.grid_size).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to the default bucket grid");
            Grid::default()
        });
        Self {
            grid,
            codec: BucketCodec::new(config.compression_level),
            max_chunk_size: config.max_chunk_size,
        }
    }

    /// The payload limit actually enforced by writes.
    pub fn chunk_limit(&self) -> usize {
        self.max_chunk_size.min(MAX_PAYLOAD_LEN)
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    /// Loaded, but no file existed.
    Missing,
    Loaded,
}

/// Why a bucket cannot be used.
#[derive(Clone, Debug)]
enum Damage {
    Hash { actual: u64 },
    Malformed(String),
}

#[derive(Clone, Debug)]
enum BucketState {
    /// Slots live in `RegionState::slots`.
    Open,
    /// Not yet decoded; the bytes are still authoritative.
    Encoded(Arc<StoredBucket>),
    /// Unusable; kept so the bytes are written back unchanged.
    Corrupt {
        stored: Arc<StoredBucket>,
        damage: Damage,
    },
}

impl Damage {
    fn error(&self, bucket: usize, stored: &StoredBucket) -> FormatError {
        match self {
            Damage::Hash { actual } => FormatError::HashMismatch {
                bucket,
                expected: stored.hash,
                actual: *actual,
            },
            Damage::Malformed(reason) => FormatError::MalformedBucket {
                bucket,
                reason: reason.clone(),
            },
        }
    }
}

struct RegionState {
    load: LoadState,
    grid: Grid,
    slots: Vec<ChunkSlot>,
    buckets: Vec<BucketState>,
    bitmap: ExistenceBitmap,
    features: Vec<Feature>,
    newest_timestamp: i64,
}

impl RegionState {
    fn new(grid: Grid) -> Self {
        Self {
            load: LoadState::Unloaded,
            grid,
            slots: vec![ChunkSlot::default(); CHUNKS_PER_REGION],
            buckets: vec![BucketState::Open; grid.bucket_count()],
            bitmap: ExistenceBitmap::new(),
            features: Vec::new(),
            newest_timestamp: 0,
        }
    }

    /// Whether slot `index` holds data, without decoding its bucket.
    fn is_present(&self, index: usize) -> bool {
        match self.buckets[self.grid.bucket_of(index)] {
            BucketState::Open => self.slots[index].is_present(),
            _ => self.bitmap.get(index),
        }
    }
}

/// What a flush writes, captured under the state lock.
enum PendingBucket {
    Empty,
    Stored(Arc<StoredBucket>),
    Slots(Vec<ChunkSlot>),
}

struct Snapshot {
    header: RegionHeader,
    buckets: Vec<PendingBucket>,
}

struct RegionInner {
    path: PathBuf,
    region_x: i32,
    region_z: i32,
    options: RegionOptions,
    context: Arc<FlushContext>,
    state: Mutex<RegionState>,
    io_lock: Mutex<()>,
    dirty: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<FlushTask>>,
}

/// Handle to one region file. Clones share the same region.
#[derive(Clone)]
pub struct RegionFile {
    inner: Arc<RegionInner>,
}

impl std::fmt::Debug for RegionFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionFile")
            .field("path", &self.inner.path)
            .field("region_x", &self.inner.region_x)
            .field("region_z", &self.inner.region_z)
            .field("dirty", &self.is_dirty())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RegionFile {
    /// Creates a handle for the region at (`region_x`, `region_z`) stored at
    /// `path`. Nothing is read until the region is first used.
    pub fn new(
        path: impl Into<PathBuf>,
        region_x: i32,
        region_z: i32,
        options: RegionOptions,
        context: Arc<FlushContext>,
    ) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                path: path.into(),
                region_x,
                region_z,
                state: Mutex::new(RegionState::new(options.grid)),
                options,
                context,
                io_lock: Mutex::new(()),
                dirty: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Region X coordinate.
    pub fn region_x(&self) -> i32 {
        self.inner.region_x
    }

    /// Region Z coordinate.
    pub fn region_z(&self) -> i32 {
        self.inner.region_z
    }

    /// Whether the backing file exists, regardless of load state.
    pub fn exists(&self) -> bool {
        self.inner.path.is_file()
    }

    /// Loads the region if it is not loaded yet.
    ///
    /// Returns `Ok(false)` when there is no file; the region then starts empty
    /// and later writes create it. A file that exists but cannot be parsed is
    /// a [`RegionError::Format`], and the region stays unusable.
    pub fn read(&self) -> Result<bool, RegionError> {
        let mut state = self.lock_open()?;
        self.load(&mut state)
    }

    /// Stores `data` as the payload of `pos`.
    ///
    /// Payloads larger than the configured maximum are rejected with
    /// [`RegionError::Capacity`] and the slot is cleared. An empty payload
    /// leaves the slot empty.
    pub fn write_chunk(&self, pos: ChunkPos, data: &[u8]) -> Result<(), RegionError> {
        let index = pos.local_index();
        let mut state = self.open_slot(index)?;
        let inner = &self.inner;

        let max = inner.options.chunk_limit();
        if data.len() > max {
            tracing::error!(
                path = %inner.path.display(),
                x = pos.x,
                z = pos.z,
                len = data.len(),
                max,
                "rejecting oversized chunk, slot cleared"
            );
            state.slots[index].clear();
            state.bitmap.set(index, false);
            inner.mark_dirty();
            return Err(RegionError::Capacity {
                len: data.len(),
                max,
            });
        }

        let slot = inner
            .options
            .codec
            .pack_slot(data, unix_now())
            .map_err(|e| RegionError::format(&inner.path, e))?;
        state.bitmap.set(index, slot.is_present());
        state.slots[index] = slot;
        inner.mark_dirty();
        Ok(())
    }

    /// Returns the payload of `pos`, or `None` if the slot is empty.
    pub fn read_chunk(&self, pos: ChunkPos) -> Result<Option<Vec<u8>>, RegionError> {
        let index = pos.local_index();
        let state = self.open_slot(index)?;
        self.inner
            .options
            .codec
            .unpack_slot(&state.slots[index])
            .map_err(|e| RegionError::format(&self.inner.path, e))
    }

    /// Empties the slot of `pos`.
    pub fn clear_chunk(&self, pos: ChunkPos) -> Result<(), RegionError> {
        let index = pos.local_index();
        let mut state = self.open_slot(index)?;
        state.slots[index].clear();
        state.bitmap.set(index, false);
        self.inner.mark_dirty();
        Ok(())
    }

    /// Whether `pos` holds a payload. Encoded buckets are answered from the
    /// existence bitmap and stay encoded.
    pub fn has_chunk(&self, pos: ChunkPos) -> Result<bool, RegionError> {
        let mut state = self.lock_open()?;
        self.load(&mut state)?;
        Ok(state.is_present(pos.local_index()))
    }

    /// Seconds-since-epoch timestamp of the last write to `pos`, or `None` if
    /// the slot is empty.
    pub fn last_modified(&self, pos: ChunkPos) -> Result<Option<i64>, RegionError> {
        let index = pos.local_index();
        let state = self.open_slot(index)?;
        let slot = &state.slots[index];
        Ok(slot.is_present().then(|| slot.timestamp()))
    }

    /// The 1024 region-local chunk positions.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkPos> + use<> {
        (0..CHUNKS_PER_REGION).map(ChunkPos::from_local_index)
    }

    /// Indices of buckets that failed verification or decoding.
    pub fn corrupt_buckets(&self) -> Result<Vec<usize>, RegionError> {
        let mut state = self.lock_open()?;
        self.load(&mut state)?;
        Ok(state
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b, BucketState::Corrupt { .. }))
            .map(|(i, _)| i)
            .collect())
    }

    /// Whether there are changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Writes pending changes now. Returns `Ok(false)` if there were none.
    pub fn flush(&self) -> Result<bool, RegionError> {
        self.ensure_open()?;
        self.inner.persist()
    }

    /// Stops the background worker and performs a final synchronous flush.
    ///
    /// Later operations fail with [`RegionError::Closed`]. Closing again is a
    /// no-op. If the final flush fails the region stays open, with its worker
    /// running again, so the close can be retried.
    pub fn close(&self) -> Result<(), RegionError> {
        let inner = &self.inner;
        {
            // Mutations that got the lock first are dirty and go into the
            // final flush; later ones see the flag.
            let _state = inner.state.lock();
            if inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let task = inner.task.lock().take();
        let had_worker = task.is_some();
        if let Some(task) = task {
            task.stop();
        }

        match inner.persist() {
            Ok(_) => {
                tracing::debug!(path = %inner.path.display(), "region closed");
                Ok(())
            }
            Err(e) => {
                inner.closed.store(false, Ordering::Release);
                if had_worker && let Err(spawn_err) = self.start_worker() {
                    tracing::error!(
                        path = %inner.path.display(),
                        error = %spawn_err,
                        "failed to restart flush worker after a failed close"
                    );
                }
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), RegionError> {
        if self.is_closed() {
            return Err(RegionError::Closed {
                path: self.inner.path.clone(),
            });
        }
        Ok(())
    }

    /// Locks the state of a region that is still open.
    ///
    /// `close` sets its flag under the same lock, so nothing mutates the
    /// state after the final flush has been taken.
    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, RegionState>, RegionError> {
        let state = self.inner.state.lock();
        self.ensure_open()?;
        Ok(state)
    }

    /// Locks the state, loading the region and decoding the bucket of `index`.
    fn open_slot(
        &self,
        index: usize,
    ) -> Result<parking_lot::MutexGuard<'_, RegionState>, RegionError> {
        let mut state = self.lock_open()?;
        self.load(&mut state)?;
        self.inner.open_bucket(&mut state, index)?;
        Ok(state)
    }

    fn load(&self, state: &mut RegionState) -> Result<bool, RegionError> {
        match state.load {
            LoadState::Loaded => return Ok(true),
            LoadState::Missing => return Ok(false),
            LoadState::Unloaded => {}
        }

        let found = self.inner.load_from_disk(state)?;
        if let Err(e) = self.start_worker() {
            *state = RegionState::new(self.inner.options.grid);
            return Err(e);
        }
        Ok(found)
    }

    fn start_worker(&self) -> Result<(), RegionError> {
        let inner = &self.inner;
        let mut task = inner.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let name = format!("region-flush r.{}.{}", inner.region_x, inner.region_z);
        let spawned = FlushTask::spawn(name, Arc::downgrade(inner), Arc::clone(&inner.context))
            .map_err(|e| RegionError::io("starting flush worker for", &inner.path, e))?;
        *task = Some(spawned);
        Ok(())
    }
}

impl RegionInner {
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn load_from_disk(&self, state: &mut RegionState) -> Result<bool, RegionError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                state.load = LoadState::Missing;
                tracing::trace!(path = %self.path.display(), "no region file yet");
                return Ok(false);
            }
            Err(e) => return Err(RegionError::io("reading", &self.path, e)),
        };

        let parsed = format::parse(&data).map_err(|e| RegionError::format(&self.path, e))?;
        let mut fresh = RegionState::new(self.options.grid);
        match parsed {
            ParsedRegion::Legacy(legacy) => {
                // Legacy timestamps are not reliable; stamp everything as loaded now.
                let now = unix_now();
                for (index, payload) in legacy.payloads.iter().enumerate() {
                    if let Some(raw) = payload {
                        let slot = self
                            .options
                            .codec
                            .pack_slot(raw, now)
                            .map_err(|e| RegionError::format(&self.path, e))?;
                        fresh.bitmap.set(index, slot.is_present());
                        fresh.slots[index] = slot;
                    }
                }
                fresh.newest_timestamp = legacy.newest_timestamp;
                tracing::info!(
                    path = %self.path.display(),
                    chunks = legacy.present_count(),
                    "loaded legacy region, will be rewritten in bucketed format"
                );
            }
            ParsedRegion::Bucketed(region) => {
                let header = region.header;
                if (header.region_x, header.region_z) != (self.region_x, self.region_z) {
                    tracing::warn!(
                        path = %self.path.display(),
                        header_x = header.region_x,
                        header_z = header.region_z,
                        "region coordinates in header do not match file"
                    );
                }
                fresh.grid = header.grid;
                fresh.bitmap = header.bitmap;
                fresh.features = header.features;
                fresh.newest_timestamp = header.newest_timestamp;
                fresh.buckets = region
                    .buckets
                    .into_iter()
                    .enumerate()
                    .map(|(bucket, stored)| match stored {
                        None => BucketState::Open,
                        Some(stored) => match stored.verify(bucket) {
                            Ok(()) => BucketState::Encoded(Arc::new(stored)),
                            Err(e) => {
                                tracing::error!(
                                    path = %self.path.display(),
                                    bucket,
                                    error = %e,
                                    "corrupt bucket, its chunks are unavailable"
                                );
                                let actual = crate::codec::content_hash(&stored.bytes);
                                BucketState::Corrupt {
                                    stored: Arc::new(stored),
                                    damage: Damage::Hash { actual },
                                }
                            }
                        },
                    })
                    .collect();
                tracing::debug!(
                    path = %self.path.display(),
                    grid = header.grid.size(),
                    chunks = fresh.bitmap.count(),
                    "loaded region"
                );
            }
        }

        fresh.load = LoadState::Loaded;
        *state = fresh;
        Ok(true)
    }

    /// Decodes the bucket holding `index` if it is still encoded.
    fn open_bucket(&self, state: &mut RegionState, index: usize) -> Result<(), RegionError> {
        let grid = state.grid;
        let bucket = grid.bucket_of(index);
        let stored = match &state.buckets[bucket] {
            BucketState::Open => return Ok(()),
            BucketState::Encoded(stored) => Arc::clone(stored),
            BucketState::Corrupt { stored, damage } => {
                return Err(RegionError::format(
                    &self.path,
                    damage.error(bucket, stored),
                ));
            }
        };

        let slots = match self
            .options
            .codec
            .decode_bucket(bucket, &stored.bytes, grid.slots_per_bucket())
        {
            Ok(slots) => slots,
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    bucket,
                    error = %e,
                    "bucket failed to decode"
                );
                state.buckets[bucket] = BucketState::Corrupt {
                    stored,
                    damage: Damage::Malformed(e.to_string()),
                };
                return Err(RegionError::format(&self.path, e));
            }
        };

        for (index, slot) in grid.slots(bucket).zip(slots) {
            state.bitmap.set(index, slot.is_present());
            state.slots[index] = slot;
        }
        state.buckets[bucket] = BucketState::Open;
        tracing::trace!(path = %self.path.display(), bucket, "decoded bucket");
        Ok(())
    }

    fn snapshot(&self, state: &mut RegionState) -> Snapshot {
        let grid = state.grid;
        let mut newest = state.newest_timestamp;
        let mut buckets = Vec::with_capacity(grid.bucket_count());

        for bucket in 0..grid.bucket_count() {
            let pending = match &state.buckets[bucket] {
                BucketState::Encoded(stored) | BucketState::Corrupt { stored, .. } => {
                    PendingBucket::Stored(Arc::clone(stored))
                }
                BucketState::Open => {
                    let mut any = false;
                    for index in grid.slots(bucket) {
                        let slot = &state.slots[index];
                        state.bitmap.set(index, slot.is_present());
                        if slot.is_present() {
                            any = true;
                            newest = newest.max(slot.timestamp());
                        }
                    }
                    if any {
                        PendingBucket::Slots(
                            grid.slots(bucket).map(|i| state.slots[i].clone()).collect(),
                        )
                    } else {
                        PendingBucket::Empty
                    }
                }
            };
            buckets.push(pending);
        }
        state.newest_timestamp = newest;

        Snapshot {
            header: RegionHeader {
                newest_timestamp: newest,
                grid,
                region_x: self.region_x,
                region_z: self.region_z,
                bitmap: state.bitmap,
                features: state.features.clone(),
            },
            buckets,
        }
    }

    fn persist(&self) -> Result<bool, RegionError> {
        let _io = self.io_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let snapshot = {
            let mut state = self.state.lock();
            self.snapshot(&mut state)
        };
        match self.write_snapshot(snapshot) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), RegionError> {
        let level = level_byte(self.options.codec.level());
        let mut reused = 0usize;
        let mut encoded = Vec::with_capacity(snapshot.buckets.len());
        for pending in snapshot.buckets {
            let stored = match pending {
                PendingBucket::Empty => None,
                PendingBucket::Stored(stored) => {
                    reused += 1;
                    Some(stored)
                }
                PendingBucket::Slots(slots) => self
                    .options
                    .codec
                    .encode_bucket(&slots)
                    .map_err(|e| RegionError::format(&self.path, e))?
                    .map(|bytes| Arc::new(StoredBucket::new(bytes, level))),
            };
            encoded.push(stored);
        }
        let buckets: Vec<Option<&StoredBucket>> = encoded.iter().map(Option::as_deref).collect();

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| RegionError::io("creating directory", parent, e))?;
        }

        let tmp = tmp_path(&self.path);
        let written = write_file(&tmp, &snapshot.header, &buckets, level)
            .and_then(|len| fs::rename(&tmp, &self.path).map(|()| len));
        let len = match written {
            Ok(len) => len,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(RegionError::io("writing", &self.path, e));
            }
        };
        sync_parent(&self.path);

        tracing::debug!(
            path = %self.path.display(),
            bytes = len,
            reused,
            chunks = snapshot.header.bitmap.count(),
            "region flushed"
        );
        Ok(())
    }
}

impl FlushTarget for RegionInner {
    fn needs_flush(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<bool, RegionError> {
        self.persist()
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Disconnects the worker; it may be the thread running this drop.
        drop(self.task.get_mut().take());
        if self.dirty.load(Ordering::Acquire)
            && let Err(e) = self.persist()
        {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to flush region on drop, changes lost"
            );
        }
    }
}

/// Writes and fsyncs a complete region file at `path`, returning its length.
fn write_file(
    path: &Path,
    header: &RegionHeader,
    buckets: &[Option<&StoredBucket>],
    empty_level: u8,
) -> std::io::Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    bucketed::write(&mut writer, header, buckets, empty_level)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Best-effort fsync of the directory holding `path`, making the rename durable.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })
        && let Err(e) = dir.sync_all()
    {
        tracing::trace!(path = %parent.display(), error = %e, "directory sync failed");
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn level_byte(level: i32) -> u8 {
    level.clamp(0, u8::MAX as i32) as u8
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
