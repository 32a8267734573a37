//! Two-step device probe: TCP reachability, then the identity check

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use wled_client::{ClientError, DeviceApi, ErrorKind, Identity, DEFAULT_HTTP_PORT};
use wled_core::{strip_scheme, Info};

/// Connect timeout for the reachability step in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Why a probe did not confirm a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ProbeFailure {
    /// No connection within the connect timeout
    Timeout,
    /// The transport refused or failed the connection
    Unreachable(String),
    /// Reachable, but the identity request failed in transport
    Network(String),
    /// Reachable, but the identity endpoint answered with a non-success status
    Protocol(String),
    /// Reachable, but the body was not a WLED self-description
    Schema(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            ProbeFailure::Network(reason) => write!(f, "network: {}", reason),
            ProbeFailure::Protocol(reason) => write!(f, "protocol: {}", reason),
            ProbeFailure::Schema(reason) => write!(f, "not a WLED device: {}", reason),
        }
    }
}

impl From<ClientError> for ProbeFailure {
    fn from(e: ClientError) -> Self {
        match e.kind() {
            ErrorKind::Network => ProbeFailure::Network(e.to_string()),
            ErrorKind::Protocol => ProbeFailure::Protocol(e.to_string()),
            ErrorKind::Schema => ProbeFailure::Schema(e.to_string()),
        }
    }
}

/// Result of probing one address; produced exactly once per address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub address: String,
    pub reachable: bool,
    pub is_target_device: bool,
    pub display_name: Option<String>,
    pub firmware_version: Option<String>,
    pub brand: Option<String>,
    pub elapsed_ms: u64,
    pub error: Option<ProbeFailure>,
    /// Full self-description of a confirmed device
    #[serde(skip)]
    pub info: Option<Info>,
}

impl ProbeOutcome {
    pub fn unreachable(address: &str, failure: ProbeFailure) -> Self {
        Self {
            address: address.to_string(),
            reachable: false,
            is_target_device: false,
            display_name: None,
            firmware_version: None,
            brand: None,
            elapsed_ms: 0,
            error: Some(failure),
            info: None,
        }
    }

    pub fn confirmed(address: &str, identity: &Identity) -> Self {
        Self {
            address: address.to_string(),
            reachable: true,
            is_target_device: true,
            display_name: Some(identity.name.clone()),
            firmware_version: identity.version.clone(),
            brand: identity.brand.clone(),
            elapsed_ms: 0,
            error: None,
            info: Some(identity.info.clone()),
        }
    }

    pub fn rejected(address: &str, failure: ProbeFailure) -> Self {
        Self {
            reachable: true,
            ..Self::unreachable(address, failure)
        }
    }
}

/// Something that can probe a single address
///
/// Implementations must hold no shared mutable state: the scanner runs many
/// probes concurrently.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeOutcome;
}

/// Probe backed by a TCP connect and the device's JSON API
#[derive(Clone)]
pub struct DeviceProber {
    api: Arc<dyn DeviceApi>,
    port: u16,
    connect_timeout: Duration,
}

impl DeviceProber {
    pub fn new(api: Arc<dyn DeviceApi>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            api,
            port,
            connect_timeout,
        }
    }

    pub fn with_defaults(api: Arc<dyn DeviceApi>) -> Self {
        Self::new(
            api,
            DEFAULT_HTTP_PORT,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }

    /// Open and immediately drop a TCP connection to the device's port
    pub async fn check_reachable(&self, address: &str) -> Result<(), ProbeFailure> {
        let target = socket_target(address, self.port);
        trace!(target = %target, "Checking reachability");

        await_connect(self.connect_timeout, TcpStream::connect(target.as_str())).await
    }
}

/// Settle a connect attempt within `limit`; the stream is dropped right away
async fn await_connect<F>(limit: Duration, connect: F) -> Result<(), ProbeFailure>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(ProbeFailure::Unreachable(e.to_string())),
        Err(_) => Err(ProbeFailure::Timeout),
    }
}

#[async_trait]
impl Probe for DeviceProber {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let started = Instant::now();

        let mut outcome = match self.check_reachable(address).await {
            Err(failure) => {
                trace!(address = %address, reason = %failure, "Address unreachable");
                ProbeOutcome::unreachable(address, failure)
            }
            Ok(()) => match self.api.verify(address).await {
                Ok(identity) => {
                    debug!(address = %address, name = %identity.name, "Confirmed WLED device");
                    ProbeOutcome::confirmed(address, &identity)
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "Reachable but not a WLED device");
                    ProbeOutcome::rejected(address, e.into())
                }
            },
        };

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        outcome
    }
}

/// `host:port` string for a connect, honoring an explicit port in `address`
pub fn socket_target(address: &str, port: u16) -> String {
    let host = strip_scheme(address).trim_end_matches('/');
    match host.matches(':').count() {
        0 => format!("{}:{}", host, port),
        1 => host.to_string(),
        _ if host.starts_with('[') => format!("{}:{}", host, port),
        _ => format!("[{}]:{}", host, port),
    }
}
