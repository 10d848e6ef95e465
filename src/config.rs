//! Configuration
//!
//! TOML file mirroring the engine's control surface: adapter, XLink Kai
//! endpoint, device variant and filter knobs, logging.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::xlink::DEFAULT_PORT;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Wireless adapter to capture on (e.g. wlan0)
    #[serde(default)]
    pub adapter: String,

    /// XLink Kai IP address; ignored when auto-discovery is on
    #[serde(default = "default_xlink_ip")]
    pub xlink_ip: String,

    /// XLink Kai UDP port
    #[serde(default = "default_xlink_port")]
    pub xlink_port: u16,

    /// Use the host-side PSP plugin device instead of the generic monitor
    /// device
    #[serde(default)]
    pub use_psp_plugin: bool,

    /// Locate the XLink Kai instance by broadcast instead of using
    /// `xlink_ip`
    #[serde(default = "default_true")]
    pub auto_discover_xlink: bool,

    /// Automatically listen for PSP/Vita SSID prefixes
    #[serde(default = "default_true")]
    pub auto_discover_networks: bool,

    /// Answer accepted data frames with a synthesized ACK
    #[serde(default)]
    pub acknowledge_data_frames: bool,

    /// Only bridge data frames from this MAC (empty = no filter)
    #[serde(default)]
    pub only_accept_from_mac: String,

    /// Log filter (trace/debug/info/warn/error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append-only log file
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_xlink_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_xlink_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "kaibridge.log".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter: String::new(),
            xlink_ip: default_xlink_ip(),
            xlink_port: default_xlink_port(),
            use_psp_plugin: false,
            auto_discover_xlink: true,
            auto_discover_networks: true,
            acknowledge_data_frames: false,
            only_accept_from_mac: String::new(),
            log_level: default_log_level(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.xlink_ip, "127.0.0.1");
        assert_eq!(config.xlink_port, 34523);
        assert!(config.auto_discover_xlink);
        assert!(config.auto_discover_networks);
        assert!(!config.use_psp_plugin);
        assert!(!config.acknowledge_data_frames);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            toml::from_str("adapter = \"wlan1\"\nacknowledge_data_frames = true\n").unwrap();
        assert_eq!(config.adapter, "wlan1");
        assert!(config.acknowledge_data_frames);
        assert_eq!(config.xlink_port, 34523);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.adapter = "wlan0".into();
        config.only_accept_from_mac = "aa:bb:cc:dd:ee:ff".into();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.adapter, "wlan0");
        assert_eq!(parsed.only_accept_from_mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("kaibridge-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.adapter = "wlan2".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.adapter, "wlan2");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/kaibridge.toml").unwrap();
        assert_eq!(config.adapter, "");
    }
}
