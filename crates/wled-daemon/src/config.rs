//! Configuration loading

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use wled_client::ClientConfig;
use wled_discovery::{RequestConfig, ScanConfig, DEFAULT_SERVICE_TYPE, MAX_SCAN_ADDRESSES};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds between refreshes of every stored device (0 disables)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Where the device store is persisted
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// TLS configuration (optional - enables HTTPS when present)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            refresh_interval_secs: default_refresh_interval(),
            store_path: default_store_path(),
            tls: None,
        }
    }
}

/// TLS/HTTPS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_store_path() -> String {
    "./devices.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// mDNS service type to browse
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
    /// Add scan hits to the store as they are found
    #[serde(default = "default_true")]
    pub auto_add: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_addresses")]
    pub max_addresses: usize,
    /// Network spec used when a scan is requested without one
    #[serde(default)]
    pub default_subnet: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            mdns_enabled: true,
            auto_add: true,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay(),
            max_addresses: default_max_addresses(),
            default_subnet: None,
        }
    }
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    20
}

fn default_batch_delay() -> u64 {
    100
}

fn default_max_addresses() -> usize {
    MAX_SCAN_ADDRESSES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_resource_timeout")]
    pub resource_timeout_ms: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_ms: u64,
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            resource_timeout_ms: default_resource_timeout(),
            refresh_timeout_ms: default_refresh_timeout(),
            update_timeout_secs: default_update_timeout(),
        }
    }
}

fn default_http_port() -> u16 {
    80
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    3000
}

fn default_resource_timeout() -> u64 {
    5000
}

fn default_refresh_timeout() -> u64 {
    10_000
}

fn default_update_timeout() -> u64 {
    120
}

impl Config {
    pub fn to_scan_config(&self) -> ScanConfig {
        ScanConfig {
            batch_size: self.discovery.batch_size.max(1),
            batch_delay: Duration::from_millis(self.discovery.batch_delay_ms),
            max_addresses: self.discovery.max_addresses,
            auto_add: self.discovery.auto_add,
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            port: self.device.http_port,
            request_timeout: Duration::from_millis(self.device.request_timeout_ms),
            resource_timeout: Duration::from_millis(self.device.resource_timeout_ms),
            update_timeout: Duration::from_secs(self.device.update_timeout_secs),
        }
    }

    pub fn to_request_config(&self) -> RequestConfig {
        RequestConfig {
            refresh_timeout: Duration::from_millis(self.device.refresh_timeout_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.device.connect_timeout_ms)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.bind, "0.0.0.0:8080");
        assert_eq!(config.daemon.refresh_interval_secs, 30);
        assert_eq!(config.discovery.service_type, "_http._tcp.local.");
        assert_eq!(config.discovery.batch_size, 20);
        assert_eq!(config.discovery.max_addresses, 1024);
        assert_eq!(config.device.http_port, 80);

        let scan = config.to_scan_config();
        assert_eq!(scan.batch_delay, Duration::from_millis(100));
        assert!(scan.auto_add);
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            bind = "127.0.0.1:9000"

            [discovery]
            auto_add = false
            default_subnet = "192.168.1.0/24"

            [device]
            refresh_timeout_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.bind, "127.0.0.1:9000");
        assert_eq!(config.daemon.store_path, "./devices.json");
        assert!(!config.discovery.auto_add);
        assert!(config.discovery.mdns_enabled);
        assert_eq!(config.discovery.default_subnet.as_deref(), Some("192.168.1.0/24"));
        assert_eq!(
            config.to_request_config().refresh_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.to_client_config().port, 80);
    }

    #[test]
    fn test_load_missing_and_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("wled-discovery.toml");

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:8080");

        std::fs::write(&path, "[device]\nhttp_port = 8081\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.device.http_port, 8081);

        std::fs::write(&path, "[device\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
