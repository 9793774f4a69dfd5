//! # Subscription Engine Configuration
//!
//! Settings are resolved in layers, later layers overriding earlier ones:
//!
//! 1. Built-in defaults.
//! 2. A JSON file (`--config-path` / `TDSUB_CONFIG_PATH`, default `subscribe.conf`).
//! 3. Command-line arguments and environment variables.
//!
//! [`ConfigOverrides`] is a `clap::Args` group so binaries can flatten it into
//! their own parser; the library never reads `std::env::args` itself.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SubscribeError};
use crate::progress::ProgressStore;

/// Config file read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "subscribe.conf";

/// Default interval between two topology refreshes.
pub const DEFAULT_TOPOLOGY_REFRESH_SECS: u64 = 10 * 60;

/// Default number of execution attempts per consume cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One configuration layer. Unset fields defer to the layer below.
#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[clap(long, env = "TDSUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TDSUB_DATA_DIR", help = "Data directory; progress files live in <data-dir>/subscribe.")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, env = "TDSUB_TOPOLOGY_REFRESH_SECS", help = "Seconds between two refreshes of a super table's child table list.")]
    pub topology_refresh_secs: Option<u64>,

    #[clap(long, env = "TDSUB_MAX_ATTEMPTS", help = "Query execution attempts per consume before giving up.")]
    pub max_attempts: Option<u32>,

    #[clap(long, env = "TDSUB_RESYNC_AFTER_CONSUME", help = "Force a topology refresh on the consume following every successful one.")]
    pub resync_after_consume: Option<bool>,

    #[clap(long, env = "TDSUB_LOG_DIR", help = "Directory for log files. Logs go to stdout only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TDSUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// Merges two layers, where `other` overrides `self` for `Some` values.
    pub fn merge(self, other: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            config_path: other.config_path.or(self.config_path),
            data_dir: other.data_dir.or(self.data_dir),
            topology_refresh_secs: other.topology_refresh_secs.or(self.topology_refresh_secs),
            max_attempts: other.max_attempts.or(self.max_attempts),
            resync_after_consume: other.resync_after_consume.or(self.resync_after_consume),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }
}

/// Fully resolved engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeConfig {
    /// Data directory; progress files live in `<data_dir>/subscribe`.
    pub data_dir: PathBuf,
    /// Maximum age of a subscription's child table list.
    pub topology_refresh: Duration,
    /// Query execution attempts per consume cycle.
    pub max_attempts: u32,
    /// Whether a successful consume forces a topology refresh on the next one.
    pub resync_after_consume: bool,
    /// Directory for log files.
    pub log_dir: Option<PathBuf>,
    /// Logging level name.
    pub log_level: String,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            topology_refresh: Duration::from_secs(DEFAULT_TOPOLOGY_REFRESH_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            resync_after_consume: true,
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl SubscribeConfig {
    /// A default configuration storing progress under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// The progress store rooted at this configuration's data directory.
    pub fn progress_store(&self) -> ProgressStore {
        ProgressStore::new(&self.data_dir)
    }

    fn resolve(layer: ConfigOverrides) -> Result<Self> {
        let defaults = SubscribeConfig::default();

        let max_attempts = layer.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(SubscribeError::Config("max_attempts must be at least 1".to_string()));
        }

        Ok(Self {
            data_dir: layer.data_dir.unwrap_or(defaults.data_dir),
            topology_refresh: layer
                .topology_refresh_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.topology_refresh),
            max_attempts,
            resync_after_consume: layer
                .resync_after_consume
                .unwrap_or(defaults.resync_after_consume),
            log_dir: layer.log_dir.or(defaults.log_dir),
            log_level: layer.log_level.unwrap_or(defaults.log_level),
        })
    }
}

impl fmt::Display for SubscribeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubscribeConfig
    Data dir: {},
    Topology refresh: {}s,
    Max attempts: {},
    Resync after consume: {},
    Log dir: {},
    Log level: {}
",
            self.data_dir.display(),
            self.topology_refresh.as_secs(),
            self.max_attempts,
            self.resync_after_consume,
            self.log_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.log_level
        )
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tdsub"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Resolves the configuration: defaults, then the JSON file, then `cli`.
pub fn load_config(cli: ConfigOverrides) -> Result<SubscribeConfig> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut layer = ConfigOverrides::default();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<ConfigOverrides>(&config_str) {
                Ok(file_config) => layer = layer.merge(file_config),
                Err(e) => warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    SubscribeConfig::resolve(layer.merge(cli))
}
