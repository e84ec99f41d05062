//! Configuration system for the Strata region storage engine.
//!
//! Provides runtime-configurable storage and logging settings that persist to
//! disk as RON files, with validation and forward/backward compatible
//! serialization.

mod config;
mod error;

pub use config::{Config, DebugConfig, StorageConfig};
pub use error::ConfigError;
