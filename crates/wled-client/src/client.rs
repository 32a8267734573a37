//! Device queries over the WLED JSON API

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};
use wled_core::{strip_scheme, DeviceStateInfo, Info, UNKNOWN_DEVICE_NAME};

/// Port the device's web server listens on
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Self-description endpoint (state + info)
pub const STATE_INFO_PATH: &str = "/json/si";

/// Firmware upload endpoint
pub const UPDATE_PATH: &str = "/update";

/// Per-request timeout (connect / first response)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Total time budget for one identity request
pub const DEFAULT_RESOURCE_TIMEOUT_MS: u64 = 5000;

/// Firmware uploads are slow on small devices
pub const DEFAULT_UPDATE_TIMEOUT_SECS: u64 = 120;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP error: status {0}")]
    Status(u16),
    #[error("Not a WLED device: {0}")]
    Schema(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Coarse classification kept for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failed, reset, or timed out
    Network,
    /// The server answered but not with success
    Protocol,
    /// The body was not the expected JSON
    Schema,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Network(_) | ClientError::Timeout | ClientError::InvalidAddress(_) => {
                ErrorKind::Network
            }
            ClientError::Status(_) => ErrorKind::Protocol,
            ClientError::Schema(_) => ErrorKind::Schema,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if let Some(status) = e.status() {
            ClientError::Status(status.as_u16())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

/// Identity extracted from a successful `/json/si` response
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub version: Option<String>,
    pub brand: Option<String>,
    pub info: Info,
}

impl Identity {
    pub fn from_info(info: Info) -> Self {
        let name = info
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());
        Self {
            name,
            version: info.version.clone(),
            brand: info.brand.clone(),
            info,
        }
    }
}

/// Operations the engine needs from a device
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Identity check: succeeds only for a well-formed WLED response
    async fn verify(&self, address: &str) -> Result<Identity, ClientError>;

    /// Pull the full state + info
    async fn refresh(&self, address: &str) -> Result<DeviceStateInfo, ClientError>;

    /// Upload a firmware image
    async fn push_firmware(&self, address: &str, payload: Vec<u8>) -> Result<(), ClientError>;
}

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    pub request_timeout: Duration,
    pub resource_timeout: Duration,
    pub update_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HTTP_PORT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            resource_timeout: Duration::from_millis(DEFAULT_RESOURCE_TIMEOUT_MS),
            update_timeout: Duration::from_secs(DEFAULT_UPDATE_TIMEOUT_SECS),
        }
    }
}

/// HTTP client for WLED devices
#[derive(Debug, Clone)]
pub struct WledClient {
    http: reqwest::Client,
    upload: reqwest::Client,
    port: u16,
}

impl WledClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.resource_timeout)
            .build()
            .map_err(ClientError::from_reqwest)?;
        let upload = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.update_timeout)
            .build()
            .map_err(ClientError::from_reqwest)?;

        Ok(Self {
            http,
            upload,
            port: config.port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build `http://host[:port]{path}` for an address
    pub fn url(&self, address: &str, path: &str) -> Result<String, ClientError> {
        let host = strip_scheme(address).trim_end_matches('/');
        if host.is_empty() || host.contains('/') {
            return Err(ClientError::InvalidAddress(address.to_string()));
        }

        let colons = host.matches(':').count();
        let authority = if colons == 1 {
            // Explicit host:port wins over the configured port
            host.to_string()
        } else {
            let host = if colons > 1 && !host.starts_with('[') {
                format!("[{}]", host)
            } else {
                host.to_string()
            };
            if self.port == DEFAULT_HTTP_PORT {
                host
            } else {
                format!("{}:{}", host, self.port)
            }
        };

        Ok(format!("http://{}{}", authority, path))
    }

    async fn fetch_state_info(&self, address: &str) -> Result<DeviceStateInfo, ClientError> {
        let url = self.url(address, STATE_INFO_PATH)?;
        let started = Instant::now();
        trace!(url = %url, "Requesting state info");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Unexpected HTTP status");
            return Err(ClientError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(ClientError::from_reqwest)?;
        let parsed: DeviceStateInfo =
            serde_json::from_slice(&body).map_err(|e| ClientError::Schema(e.to_string()))?;

        debug!(
            url = %url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Received state info"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl DeviceApi for WledClient {
    async fn verify(&self, address: &str) -> Result<Identity, ClientError> {
        let state_info = self.fetch_state_info(address).await?;
        Ok(Identity::from_info(state_info.info))
    }

    async fn refresh(&self, address: &str) -> Result<DeviceStateInfo, ClientError> {
        self.fetch_state_info(address).await
    }

    async fn push_firmware(&self, address: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        let url = self.url(address, UPDATE_PATH)?;
        let size = payload.len();
        info!(url = %url, bytes = size, "Uploading firmware");

        let part = reqwest::multipart::Part::bytes(payload).file_name("firmware.bin");
        let form = reqwest::multipart::Form::new().part("update", part);

        let response = self
            .upload
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        info!(url = %url, bytes = size, "Firmware upload accepted");
        Ok(())
    }
}
