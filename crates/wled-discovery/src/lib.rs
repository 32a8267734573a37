//! wled-discovery - Finding and verifying WLED devices on the local network
//!
//! This crate provides:
//! - Address enumeration from CIDR, range, wildcard, and single-address specs
//! - A two-step device probe (TCP reachability, then the `/json/si` identity check)
//! - A batched subnet scanner with cooperative cancellation
//! - A passive mDNS listener
//! - Reconciliation of sightings into the device store
//! - Per-device single-flight request queues

pub mod enumerate;
pub mod events;
pub mod listener;
pub mod probe;
pub mod reconcile;
pub mod request;
pub mod scanner;

#[cfg(test)]
mod testing;

pub use enumerate::{enumerate, plan, AddressSpec, SpecError, MAX_SCAN_ADDRESSES};
pub use events::{DeviceEvent, ScanEvent};
pub use listener::{
    BrowseEvent, DiscoveryListener, ListenerError, MdnsBrowser, ServiceBrowser,
    DEFAULT_SERVICE_TYPE,
};
pub use probe::{DeviceProber, Probe, ProbeFailure, ProbeOutcome, DEFAULT_CONNECT_TIMEOUT_MS};
pub use reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
pub use request::{
    DeviceRequest, RequestConfig, RequestError, RequestHandle, RequestOutcome, RequestRegistry,
    SharedStore,
};
pub use scanner::{ScanConfig, ScanError, ScanProgress, ScanState, SubnetScanner};
