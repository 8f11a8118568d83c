use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Game server address or CIDR block, used as `src net` in the capture filter.
    pub server_ip: String,
    /// 0 captures every port of the server.
    pub server_port: u16,
    pub snapshot_size: i32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub read_timeout: Duration,
    pub channel_capacity: usize,
    pub max_buffer_size: usize,
    /// Zero disables the stale-buffer watchdog.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stale_buffer: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub refresh_interval: Duration,
    /// Capture device to use when the address probe can't find one.
    pub device_name: Option<String>,
    pub skill_catalog: PathBuf,
    pub protocol_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_ip: "0.0.0.0/0".to_string(),
            server_port: 0,
            snapshot_size: 65535,
            read_timeout: Duration::from_millis(100),
            channel_capacity: 1024,
            max_buffer_size: 1024 * 1024,
            stale_buffer: Duration::ZERO,
            refresh_interval: Duration::from_millis(500),
            device_name: None,
            skill_catalog: PathBuf::from("skills.json"),
            protocol_file: PathBuf::from("protocol.json"),
        }
    }
}

impl AppConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        (!self.stale_buffer.is_zero()).then_some(self.stale_buffer)
    }

    /// Read timeout in the whole milliseconds libpcap expects (at least 1).
    pub fn read_timeout_ms(&self) -> i32 {
        self.read_timeout.as_millis().clamp(1, i32::MAX as u128) as i32
    }
}

/// Loads the config at `path`, writing the defaults there first if it doesn't exist.
/// A file that fails to parse falls back to defaults.
pub fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        // Create default if missing
        let default_config = AppConfig::default();
        match save_config(path, &default_config) {
            Ok(()) => info!("[Config] Wrote default config to {}", path.display()),
            Err(e) => warn!("[Config] {}", e),
        }
        return default_config;
    }

    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("[Config] Invalid {} ({}). Using defaults.", path.display(), e);
            AppConfig::default()
        }),
        Err(e) => {
            warn!("[Config] Failed to read {} ({}). Using defaults.", path.display(), e);
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(DEFAULT_CONFIG_FILE);

        let config = load_config(&path);
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
        assert_eq!(load_config(&path), AppConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, r#"{ "serverIp": "10.1.2.0/24", "serverPort": 7777, "readTimeout": 250 }"#).unwrap();

        let config = load_config(&path);
        assert_eq!(config.server_ip, "10.1.2.0/24");
        assert_eq!(config.server_port, 7777);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.channel_capacity, AppConfig::default().channel_capacity);
        assert_eq!(config.stale_after(), None);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "serverIp = nope").unwrap();
        assert_eq!(load_config(&path), AppConfig::default());
    }

    #[test]
    fn saved_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let config = AppConfig {
            device_name: Some("eth0".into()),
            stale_buffer: Duration::from_millis(500),
            ..AppConfig::default()
        };

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.stale_after(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn read_timeout_is_clamped_for_pcap() {
        let config = AppConfig { read_timeout: Duration::ZERO, ..AppConfig::default() };
        assert_eq!(config.read_timeout_ms(), 1);
        assert_eq!(AppConfig::default().read_timeout_ms(), 100);
    }
}
