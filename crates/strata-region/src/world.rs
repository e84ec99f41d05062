//! Region files of one world: data-root resolution, discovery and handle cache.
//!
//! Region files are named `r.<x>.<z>.<ext>` and live in the `region`
//! subdirectory of a world's data root. The data root is the world folder for
//! the default dimension, and `DIM-1` / `DIM1` inside it for the nether and the
//! end when those folders exist.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use strata_config::StorageConfig;

use crate::error::{RegionError, WorldError};
use crate::region::{RegionFile, RegionOptions};
use crate::scheduler::FlushContext;

/// Subdirectory holding the region files addressed by handles.
pub const REGION_DIR: &str = "region";

/// Data subdirectories scanned for region file names.
pub const DATA_SUBDIRS: [&str; 3] = [REGION_DIR, "entities", "poi"];

/// Kind of dimension a world represents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// The overworld.
    #[default]
    Normal,
    /// The nether.
    Nether,
    /// The end.
    End,
}

impl Dimension {
    /// Folder holding this dimension's data inside the world folder, if any.
    pub fn folder_name(self) -> Option<&'static str> {
        match self {
            Dimension::Normal => None,
            Dimension::Nether => Some("DIM-1"),
            Dimension::End => Some("DIM1"),
        }
    }
}

/// Where a world lives on disk, as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorldRoot {
    /// The world's folder.
    pub folder: PathBuf,
    /// The world's dimension.
    pub dimension: Dimension,
    /// Folder of the host's default world, or `None` if this is the default world.
    pub default_world_folder: Option<PathBuf>,
}

impl WorldRoot {
    /// Root of the host's default world.
    pub fn default_world(folder: impl Into<PathBuf>, dimension: Dimension) -> Self {
        Self {
            folder: folder.into(),
            dimension,
            default_world_folder: None,
        }
    }

    /// Root of a secondary world.
    pub fn secondary(
        folder: impl Into<PathBuf>,
        dimension: Dimension,
        default_world_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            folder: folder.into(),
            dimension,
            default_world_folder: Some(default_world_folder.into()),
        }
    }

    /// Resolves the directory holding this world's data subdirectories.
    ///
    /// A secondary world that reports the default world's folder as its own
    /// cannot be told apart from it and is rejected.
    pub fn data_root(&self) -> Result<PathBuf, WorldError> {
        if let Some(default) = &self.default_world_folder
            && absolute(default) == absolute(&self.folder)
        {
            return Err(WorldError::AmbiguousRoot(self.folder.clone()));
        }

        if let Some(name) = self.dimension.folder_name() {
            let dimension_folder = self.folder.join(name);
            if dimension_folder.is_dir() {
                return Ok(dimension_folder);
            }
        }
        Ok(self.folder.clone())
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Tells long-running enumeration whether its owner is still running.
pub trait Liveness: Send + Sync {
    /// `false` once the owner is shutting down.
    fn is_enabled(&self) -> bool;
}

impl<F> Liveness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_enabled(&self) -> bool {
        self()
    }
}

/// A [`Liveness`] that never shuts down.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysEnabled;

impl Liveness for AlwaysEnabled {
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Parses `r.<x>.<z>.<extension>` into region coordinates.
pub fn parse_region_name(name: &str, extension: &str) -> Option<(i32, i32)> {
    let rest = name.strip_prefix("r.")?;
    let rest = rest.strip_suffix(extension)?.strip_suffix('.')?;
    let (x, z) = rest.split_once('.')?;
    Some((parse_coord(x)?, parse_coord(z)?))
}

fn parse_coord(s: &str) -> Option<i32> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// The region files of one world.
pub struct WorldStore {
    root: WorldRoot,
    options: RegionOptions,
    context: Arc<FlushContext>,
    extension: String,
    liveness: Arc<dyn Liveness>,
    regions: DashMap<(i32, i32), RegionFile>,
}

impl std::fmt::Debug for WorldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStore")
            .field("root", &self.root)
            .field("extension", &self.extension)
            .field("open_regions", &self.regions.len())
            .finish()
    }
}

impl WorldStore {
    /// Creates a store for `root`. Region handles share `context`.
    pub fn new(
        root: WorldRoot,
        options: RegionOptions,
        context: Arc<FlushContext>,
        extension: impl Into<String>,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self {
            root,
            options,
            context,
            extension: extension.into(),
            liveness,
            regions: DashMap::new(),
        }
    }

    /// Creates a store using the storage settings.
    pub fn from_config(
        root: WorldRoot,
        config: &StorageConfig,
        context: Arc<FlushContext>,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self::new(
            root,
            RegionOptions::from_config(config),
            context,
            config.file_extension.clone(),
            liveness,
        )
    }

    /// The world this store serves.
    pub fn root(&self) -> &WorldRoot {
        &self.root
    }

    /// Resolved data root of the world.
    pub fn data_root(&self) -> Result<PathBuf, RegionError> {
        Ok(self.root.data_root()?)
    }

    /// File name of the region at (`x`, `z`).
    pub fn file_name(&self, x: i32, z: i32) -> String {
        format!("r.{x}.{z}.{}", self.extension)
    }

    /// Handle for the region at (`x`, `z`), created on first request.
    ///
    /// The region is not loaded until it is used.
    pub fn region_at(&self, x: i32, z: i32) -> Result<RegionFile, RegionError> {
        if let Some(region) = self.regions.get(&(x, z)) {
            return Ok(region.clone());
        }
        let path = self.data_root()?.join(REGION_DIR).join(self.file_name(x, z));
        let region = self
            .regions
            .entry((x, z))
            .or_insert_with(|| {
                RegionFile::new(path, x, z, self.options, Arc::clone(&self.context))
            })
            .clone();
        Ok(region)
    }

    /// Number of cached region handles.
    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    /// Handles for every region file on disk, in random order.
    ///
    /// Names that do not parse are skipped. Iteration stops early once the
    /// store's [`Liveness`] reports the owner shutting down.
    pub fn list_regions(
        &self,
    ) -> Result<impl Iterator<Item = RegionFile> + '_, RegionError> {
        let root = self.data_root()?;
        let mut names = Vec::new();
        for sub in DATA_SUBDIRS {
            let dir = root.join(sub);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "cannot list data directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                match entry.file_name().into_string() {
                    Ok(name) => names.push(name),
                    Err(name) => tracing::trace!(?name, "skipping non UTF-8 file name"),
                }
            }
        }

        names.sort_unstable();
        names.dedup();
        // Interrupted scans should not keep starving the same regions.
        names.shuffle(&mut rand::rng());
        tracing::debug!(root = %root.display(), candidates = names.len(), "listing regions");

        Ok(names
            .into_iter()
            .take_while(|_| self.liveness.is_enabled())
            .filter_map(move |name| match parse_region_name(&name, &self.extension) {
                Some((x, z)) => self.region_at(x, z).ok(),
                None => {
                    tracing::trace!(name = %name, "skipping non-region file");
                    None
                }
            }))
    }

    /// Closes and forgets the region at (`x`, `z`), if a handle exists.
    pub fn close_region(&self, x: i32, z: i32) -> Result<(), RegionError> {
        match self.regions.remove(&(x, z)) {
            Some((_, region)) => region.close(),
            None => Ok(()),
        }
    }

    /// Closes every cached region, returning the first error.
    ///
    /// Every region is attempted even after a failure.
    pub fn close_all(&self) -> Result<(), RegionError> {
        let keys: Vec<(i32, i32)> = self.regions.iter().map(|entry| *entry.key()).collect();
        let mut first_error = None;
        for (x, z) in keys {
            if let Err(e) = self.close_region(x, z) {
                tracing::error!(x, z, error = %e, "failed to close region");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
