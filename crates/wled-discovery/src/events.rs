//! Events published by the engine

use serde::Serialize;
use wled_core::{DeviceId, DeviceRecord};

use crate::probe::ProbeOutcome;
use crate::scanner::ScanState;

/// Changes to the device store
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    Created(DeviceRecord),
    Updated(DeviceRecord),
    Removed(DeviceId),
}

/// Lifecycle of a subnet scan session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent {
    Started {
        spec: String,
        total: usize,
    },
    DeviceFound(ProbeOutcome),
    Finished {
        state: ScanState,
        checked: usize,
        found: usize,
    },
}
