//! wled-core - Core types for WLED device discovery
//!
//! This crate provides the foundational types shared by the other crates:
//! - Device records and address normalization
//! - The `/json/si` state and info schema
//! - The device store collaborator and its in-memory and JSON implementations

pub mod device;
pub mod info;
pub mod store;

pub use device::{
    normalize_address, strip_scheme, strip_zone, DeviceId, DeviceRecord, NewDevice,
    UNKNOWN_DEVICE_NAME,
};
pub use info::{DeviceStateInfo, Info, WledState};
pub use store::{DeviceStore, JsonStore, MemoryStore, StoreError};
