// src/settings.rs
//
// Engine configuration. Every field has a serde default so a partial TOML
// document (or none at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::checksums::{Crc8, Crc8Polynomial};
use crate::io::serial::Parity;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long a command may stay in flight before it is failed
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Distributor back-off when an iteration found nothing to do
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Number of module config fragments a full "get module config" yields
    #[serde(default = "default_hw_channel_count")]
    pub hw_channel_count: u8,
    #[serde(default)]
    pub crc_polynomial: Crc8Polynomial,

    // Negotiation
    #[serde(default = "default_device_name_filters")]
    pub device_name_filters: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_cable_baud_rate")]
    pub cable_baud_rate: u32,
    #[serde(default = "default_radio_baud_rate")]
    pub radio_baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    /// Radio dongle API mode 2 (escaped frames)
    #[serde(default = "default_radio_api_escaped")]
    pub radio_api_escaped: bool,
    /// Reader thread poll timeout on the serial port
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    // TCP fan-out
    #[serde(default = "default_tcp_bind_address")]
    pub tcp_bind_address: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_accept_poll_interval_ms")]
    pub accept_poll_interval_ms: u64,
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
}

fn default_command_timeout_ms() -> u64 {
    2000
}
fn default_keep_alive_interval_ms() -> u64 {
    3000
}
fn default_idle_sleep_ms() -> u64 {
    10
}
fn default_hw_channel_count() -> u8 {
    8
}
fn default_device_name_filters() -> Vec<String> {
    vec!["Neurolink".to_string(), "Serial Converter".to_string()]
}
fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_cable_baud_rate() -> u32 {
    115_200
}
fn default_radio_baud_rate() -> u32 {
    115_200
}
fn default_radio_api_escaped() -> bool {
    true
}
fn default_read_timeout_ms() -> u64 {
    5
}
fn default_tcp_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_tcp_port() -> u16 {
    23561
}
fn default_accept_poll_interval_ms() -> u64 {
    1000
}
fn default_client_queue_depth() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            hw_channel_count: default_hw_channel_count(),
            crc_polynomial: Crc8Polynomial::default(),
            device_name_filters: default_device_name_filters(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            cable_baud_rate: default_cable_baud_rate(),
            radio_baud_rate: default_radio_baud_rate(),
            parity: Parity::default(),
            radio_api_escaped: default_radio_api_escaped(),
            read_timeout_ms: default_read_timeout_ms(),
            tcp_bind_address: default_tcp_bind_address(),
            tcp_port: default_tcp_port(),
            accept_poll_interval_ms: default_accept_poll_interval_ms(),
            client_queue_depth: default_client_queue_depth(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialise settings: {}", e))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn crc(&self) -> Crc8 {
        Crc8::new(self.crc_polynomial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.tcp_port, 23561);
        assert_eq!(cfg.crc_polynomial, Crc8Polynomial::Pic16_18);
        assert_eq!(cfg.device_name_filters, vec!["Neurolink", "Serial Converter"]);
    }

    #[test]
    fn test_partial_override() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            command_timeout_ms = 750
            hw_channel_count = 4
            crc_polynomial = "ccitt"
            parity = "even"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.command_timeout(), Duration::from_millis(750));
        assert_eq!(cfg.hw_channel_count, 4);
        assert_eq!(cfg.crc_polynomial, Crc8Polynomial::Ccitt);
        assert_eq!(cfg.parity, Parity::Even);
        assert_eq!(cfg.keep_alive_interval_ms, 3000);
    }

    #[test]
    fn test_custom_polynomial() {
        let cfg = EngineConfig::from_toml_str("crc_polynomial = { custom = 47 }").unwrap();
        assert_eq!(cfg.crc_polynomial, Crc8Polynomial::Custom(0x2F));
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut cfg = EngineConfig::default();
        cfg.tcp_port = 0;
        cfg.radio_api_escaped = false;
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("neurolink-does-not-exist.toml");
        assert_eq!(EngineConfig::load(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_invalid_document_is_an_error() {
        assert!(EngineConfig::from_toml_str("tcp_port = \"abc\"").is_err());
    }
}
