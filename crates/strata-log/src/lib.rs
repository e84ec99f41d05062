//! Structured logging for the Strata storage engine.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and, in
//! debug builds, a JSON file layer. The filter honours `RUST_LOG` first, then
//! the configured `debug.log_level`.

use std::path::Path;

use strata_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config provides one.
const DEFAULT_FILTER: &str = "info";

/// File name of the JSON log written in debug builds.
const LOG_FILE: &str = "strata.log";

/// Picks the filter string: the config's level when set, otherwise [`DEFAULT_FILTER`].
fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.clone()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - console output with uptime, target, level and thread name (flush workers
///   are named after the region they serve)
/// - a JSON file layer in `log_dir/strata.log` when `debug_build` is set
/// - `RUST_LOG` filtering, falling back to `config.debug.log_level`
///
/// Calling this twice panics inside `tracing_subscriber`; call it once at startup.
///
/// ```no_run
/// use strata_config::Config;
/// use strata_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), cfg!(debug_assertions), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter = default_env_filter();
        assert!(format!("{filter}").contains("info"));
    }

    #[test]
    fn test_config_level_is_used() {
        let mut config = Config::default();
        config.debug.log_level = "warn,strata_region=trace".to_string();
        assert_eq!(filter_directives(Some(&config)), "warn,strata_region=trace");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_directives(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_directives(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,strata_region=trace",
            "warn,strata_region::scheduler=debug",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {filter_str}");
        }
    }

    // The only test that installs the global subscriber.
    #[test]
    fn test_debug_build_writes_json_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let mut config = Config::default();
        config.debug.log_level = "info".to_string();

        init_logging(Some(&log_dir), true, Some(&config));

        let log_file = log_dir.join(LOG_FILE);
        assert!(log_file.is_file());

        tracing::info!(region = "r.1.2", "log file ready");
        if tracing::enabled!(tracing::Level::INFO) {
            let contents = std::fs::read_to_string(&log_file).unwrap();
            let line = contents.lines().last().unwrap();
            assert!(line.starts_with('{'), "not JSON: {line}");
            assert!(line.contains("log file ready"));
            assert!(line.contains("r.1.2"));
        }
    }
}
