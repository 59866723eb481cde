//! Configuration loading from `modlink.toml` with defaults.
//!
//! The file holds the [`BusConfig`] keys at the top level:
//!
//! ```toml
//! connection = "server:tcp://*:33221"
//! codec = "text"
//! query_timeout_ms = 500
//! ```

use modlink_types::BusConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV: &str = "MODLINK_CONFIG";

/// Load bus configuration from a TOML file, with defaults.
///
/// Without an explicit path, `$MODLINK_CONFIG` is used, then `modlink.toml`
/// in the working directory. Missing keys take their defaults; a missing,
/// unreadable or invalid file yields [`BusConfig::default`].
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BusConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return BusConfig::default();
        }
    };

    match toml::from_str::<BusConfig>(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            BusConfig::default()
        }
    }
}

/// `$MODLINK_CONFIG`, or `./modlink.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("modlink.toml"))
}
