//! Device records tracked by the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::info::{DeviceStateInfo, Info};

/// Placeholder name for devices that do not report one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown WLED Device";

/// Stable identifier for a device, generated once on first sighting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A device known to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable identifier (never changes)
    pub id: DeviceId,
    /// Normalized address, the join key between discovery and the store
    pub address: String,
    /// Display name
    pub name: String,
    /// Name was pinned by the user; discovery must not overwrite it
    #[serde(default)]
    pub is_custom_name: bool,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub is_online: bool,
    /// A refresh request is executing against this device
    #[serde(default)]
    pub is_refreshing: bool,
    #[serde(default)]
    pub brightness: u8,
    #[serde(default)]
    pub is_powered_on: bool,
    /// Primary color as 0xAARRGGBB
    #[serde(default)]
    pub color: u32,
    /// Last info block returned by the device
    #[serde(default)]
    pub info: Option<Info>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a record for a device first seen at `address`
    pub fn new(address: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: DeviceId::generate(),
            address: normalize_address(address),
            name: name.to_string(),
            is_custom_name: false,
            is_hidden: false,
            is_online: false,
            is_refreshing: false,
            brightness: 0,
            is_powered_on: false,
            color: 0,
            info: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Apply a refresh response to the runtime fields
    pub fn apply_state(&mut self, state_info: &DeviceStateInfo) {
        let was_online = self.is_online;
        let was_powered_on = self.is_powered_on;

        self.is_online = true;
        self.brightness = state_info.state.brightness;
        self.is_powered_on = state_info.state.on;
        if let Some(color) = state_info.state.primary_color() {
            self.color = color;
        }
        self.info = Some(state_info.info.clone());
        self.touch();

        if !was_online {
            tracing::debug!(address = %self.address, "Device came online");
        }
        if was_powered_on != self.is_powered_on {
            tracing::debug!(
                address = %self.address,
                on = self.is_powered_on,
                "Device power state changed"
            );
        }
    }
}

/// Fields for creating a new record through the store
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub address: String,
    pub name: String,
    pub is_custom_name: bool,
    pub is_hidden: bool,
    pub is_online: bool,
    /// Identity seen at discovery, until a refresh replaces it
    pub info: Option<Info>,
}

impl NewDevice {
    pub fn into_record(self) -> DeviceRecord {
        let mut record = DeviceRecord::new(&self.address, &self.name);
        record.is_custom_name = self.is_custom_name;
        record.is_hidden = self.is_hidden;
        record.is_online = self.is_online;
        record.info = self.info;
        record
    }
}

/// Strip a leading `http://` or `https://`, in any letter case
pub fn strip_scheme(address: &str) -> &str {
    let trimmed = address.trim();
    for scheme in ["http://", "https://"] {
        match trimmed.get(..scheme.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => {
                return &trimmed[scheme.len()..];
            }
            _ => {}
        }
    }
    trimmed
}

/// Strip an IPv6 scope/zone suffix (`fe80::1%en0` -> `fe80::1`)
pub fn strip_zone(address: &str) -> &str {
    address.split('%').next().unwrap_or(address)
}

/// Normalize an address so two sightings of the same device compare equal.
///
/// Lowercases, strips the scheme, trailing slashes, IPv6 brackets and zone,
/// and a trailing root dot on hostnames.
pub fn normalize_address(address: &str) -> String {
    let address = strip_scheme(address).trim_end_matches('/');
    let address = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);
    let address = strip_zone(address).trim_end_matches('.');
    address.to_ascii_lowercase()
}

/// Pack an RGB triple into 0xFFRRGGBB
pub fn color_from_rgb(red: u8, green: u8, blue: u8) -> u32 {
    0xFF00_0000 | ((red as u32) << 16) | ((green as u32) << 8) | blue as u32
}
