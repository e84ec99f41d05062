//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside a config directory.
const CONFIG_FILE: &str = "config.ron";

/// Grid sizes accepted for bucketed region files.
const VALID_GRID_SIZES: [u8; 6] = [1, 2, 4, 8, 16, 32];

/// Top-level storage engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Region storage settings.
    pub storage: StorageConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Region storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// zstd level used when a bucket is compressed for disk (1–22).
    pub compression_level: i32,
    /// Buckets per axis for newly written region files (1, 2, 4, 8, 16 or 32).
    pub grid_size: u8,
    /// How often each open region checks whether it needs flushing, in milliseconds.
    pub flush_interval_ms: u64,
    /// Maximum number of region flushes executing at the same time, process-wide.
    pub max_concurrent_flushes: usize,
    /// Largest chunk payload accepted by a write, in bytes.
    pub max_chunk_size: usize,
    /// File extension of region files, without the leading dot.
    pub file_extension: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn,strata_region=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_level: 1,
            grid_size: 8,
            flush_interval_ms: 100,
            max_concurrent_flushes: 6,
            max_chunk_size: 500 * 1024 * 1024,
            file_extension: "linear".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Validation ---

impl StorageConfig {
    /// Checks that every storage setting is usable by the region engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::Invalid {
                field: "storage.compression_level",
                reason: format!("{} is outside 1..=22", self.compression_level),
            });
        }
        if !VALID_GRID_SIZES.contains(&self.grid_size) {
            return Err(ConfigError::Invalid {
                field: "storage.grid_size",
                reason: format!("{} is not a power of two dividing 32", self.grid_size),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.flush_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_flushes == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.max_concurrent_flushes",
                reason: "at least one flush must be allowed".to_string(),
            });
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > i32::MAX as usize - 8 {
            return Err(ConfigError::Invalid {
                field: "storage.max_chunk_size",
                reason: format!("{} does not fit a bucket record", self.max_chunk_size),
            });
        }
        if self.file_extension.is_empty() || self.file_extension.contains('.') {
            return Err(ConfigError::Invalid {
                field: "storage.file_extension",
                reason: format!("{:?} must be a non-empty name without dots", self.file_extension),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    ///
    /// A loaded config is validated before it is returned.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("grid_size: 8"));
        assert!(ron_str.contains("max_concurrent_flushes: 6"));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(storage: (grid_size: 4))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.storage.grid_size, 4);
        assert_eq!(config.storage.flush_interval_ms, 100);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_grid_size_rejected() {
        for bad in [0u8, 3, 6, 64] {
            let mut config = Config::default();
            config.storage.grid_size = bad;
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { field: "storage.grid_size", .. }),
                "grid size {bad} should be rejected, got {err:?}"
            );
        }
        for good in VALID_GRID_SIZES {
            let mut config = Config::default();
            config.storage.grid_size = good;
            assert!(config.validate().is_ok(), "grid size {good} should be accepted");
        }
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = Config::default();
        config.storage.max_concurrent_flushes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.compression_level = 23;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.file_extension = "tar.gz".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.max_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.grid_size = 16;
        config.storage.compression_level = 6;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(storage: (grid_size: 5))").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.storage.flush_interval_ms = 250;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().storage.flush_interval_ms, 250);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
