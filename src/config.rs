//! Configuration for biosync.

use crate::store::StoreConfig;
use crate::sync::retention::DEFAULT_ARCHIVE_KEEP;
use crate::sync::transport::DEFAULT_CHANNEL;
use crate::collector::producer::SYNTHETIC_RATE_HZ;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration, shared by the origin and destination roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-sensor CSV logs written during collection
    pub data_dir: PathBuf,

    /// Outgoing archives, removed after each send
    pub staging_dir: PathBuf,

    /// Received archives, kept up to `archive_keep`
    pub inbox_dir: PathBuf,

    /// Extraction scratch directory
    pub work_dir: PathBuf,

    /// Shared directory used by the directory transport
    pub spool_dir: PathBuf,

    /// SQLite database of ingested records
    pub database_path: PathBuf,

    /// Logical channel id packages travel on
    pub channel: String,

    #[serde(with = "duration_serde")]
    pub sync_interval: Duration,

    /// Tolerance window before each interval boundary
    #[serde(with = "duration_serde")]
    pub sync_flex: Duration,

    pub max_retries: u32,

    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,

    pub archive_keep: usize,

    pub synthetic_rate_hz: u32,

    /// Ignore readings whose timestamp is already stored
    pub deduplicate_readings: bool,

    /// Whether collection is currently paused
    pub paused: bool,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("biosync");
        Self::under(&base)
    }
}

impl Config {
    /// Default settings with every directory placed under `base`.
    pub fn under(base: &Path) -> Self {
        Self {
            data_dir: base.join("logs"),
            staging_dir: base.join("staging"),
            inbox_dir: base.join("inbox"),
            work_dir: base.join("work"),
            spool_dir: base.join("spool"),
            database_path: base.join("sensors.db"),
            channel: DEFAULT_CHANNEL.to_string(),
            sync_interval: Duration::from_secs(2 * 60 * 60),
            sync_flex: Duration::from_secs(30 * 60),
            max_retries: 3,
            retry_backoff: Duration::from_secs(30),
            archive_keep: DEFAULT_ARCHIVE_KEEP,
            synthetic_rate_hz: SYNTHETIC_RATE_HZ,
            deduplicate_readings: false,
            paused: false,
        }
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("biosync")
            .join("config.json")
    }

    /// Path of the persisted pipeline counters.
    pub fn stats_path(&self) -> PathBuf {
        self.database_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipeline_stats.json")
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: Some(self.database_path.clone()),
            deduplicate: self.deduplicate_readings,
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.data_dir,
            &self.staging_dir,
            &self.inbox_dir,
            &self.spool_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Durations are stored as whole seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync_interval, Duration::from_secs(7200));
        assert_eq!(config.sync_flex, Duration::from_secs(1800));
        assert_eq!(config.archive_keep, 10);
        assert_eq!(config.synthetic_rate_hz, 25);
        assert_eq!(config.channel, "/sensor-data");
        assert!(!config.deduplicate_readings);
        assert!(!config.paused);
    }

    #[test]
    fn test_round_trip_through_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = Config::under(tmp.path());
        config.paused = true;
        config.sync_interval = Duration::from_secs(600);
        config.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"sync_interval\": 600"));

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "archive_keep": 3 }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.archive_keep, 3);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_missing_file_is_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }
}
