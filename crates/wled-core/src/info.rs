//! JSON schema of the device's `/json/si` endpoint
//!
//! Only the fields the engine reads are modelled; everything else in the
//! device's response is ignored. The `info` object is required: a body
//! without it is not a WLED device.

use serde::{Deserialize, Serialize};

use crate::device::color_from_rgb;

/// Combined state + info response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateInfo {
    #[serde(default)]
    pub state: WledState,
    pub info: Info,
}

/// Self-description block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Info {
    pub name: Option<String>,
    #[serde(rename = "ver", alias = "version")]
    pub version: Option<String>,
    pub brand: Option<String>,
    pub product: Option<String>,
    pub mac: Option<String>,
    pub arch: Option<String>,
    pub ip: Option<String>,
}

impl Info {
    /// Overlay the fields `newer` reports, keeping the rest
    pub fn merge(&mut self, newer: &Info) {
        let overlay = |field: &mut Option<String>, value: &Option<String>| {
            if value.is_some() {
                field.clone_from(value);
            }
        };
        overlay(&mut self.name, &newer.name);
        overlay(&mut self.version, &newer.version);
        overlay(&mut self.brand, &newer.brand);
        overlay(&mut self.product, &newer.product);
        overlay(&mut self.mac, &newer.mac);
        overlay(&mut self.arch, &newer.arch);
        overlay(&mut self.ip, &newer.ip);
    }
}

/// Runtime state block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WledState {
    pub on: bool,
    #[serde(rename = "bri")]
    pub brightness: u8,
    #[serde(rename = "seg")]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segment {
    /// Color slots; each slot is `[r, g, b]` or `[r, g, b, w]`
    #[serde(rename = "col")]
    pub colors: Vec<Vec<serde_json::Value>>,
}

impl WledState {
    /// Primary color of the first segment as 0xFFRRGGBB
    pub fn primary_color(&self) -> Option<u32> {
        let slot = self.segments.first()?.colors.first()?;
        let channel = |i: usize| -> Option<u8> {
            let value = slot.get(i)?.as_f64()?;
            Some((value + 0.5).clamp(0.0, 255.0) as u8)
        };
        Some(color_from_rgb(channel(0)?, channel(1)?, channel(2)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "state": {"on": true, "bri": 128, "seg": [{"col": [[255, 160, 0], [0, 0, 0], [0, 0, 0]]}]},
        "info": {"ver": "0.14.4", "name": "Kitchen", "brand": "WLED", "arch": "esp32", "leds": {"count": 30}}
    }"#;

    #[test]
    fn test_parse_state_info() {
        let parsed: DeviceStateInfo = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(parsed.info.name.as_deref(), Some("Kitchen"));
        assert_eq!(parsed.info.version.as_deref(), Some("0.14.4"));
        assert_eq!(parsed.info.brand.as_deref(), Some("WLED"));
        assert!(parsed.state.on);
        assert_eq!(parsed.state.brightness, 128);
        assert_eq!(parsed.state.primary_color(), Some(0xFFFF_A000));
    }

    #[test]
    fn test_info_is_required() {
        let result: Result<DeviceStateInfo, _> = serde_json::from_str(r#"{"state": {"on": true}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_info_is_accepted() {
        let parsed: DeviceStateInfo = serde_json::from_str(r#"{"info": {}}"#).unwrap();
        assert!(parsed.info.name.is_none());
        assert_eq!(parsed.state.primary_color(), None);
    }

    #[test]
    fn test_merge_keeps_unreported_fields() {
        let mut known = Info {
            name: Some("Kitchen".to_string()),
            version: Some("0.14.0".to_string()),
            mac: Some("aabbccddeeff".to_string()),
            ..Default::default()
        };
        known.merge(&Info {
            version: Some("0.14.4".to_string()),
            brand: Some("WLED".to_string()),
            ..Default::default()
        });

        assert_eq!(known.name.as_deref(), Some("Kitchen"));
        assert_eq!(known.version.as_deref(), Some("0.14.4"));
        assert_eq!(known.brand.as_deref(), Some("WLED"));
        assert_eq!(known.mac.as_deref(), Some("aabbccddeeff"));
    }
}
