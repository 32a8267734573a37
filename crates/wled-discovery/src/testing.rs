//! Fakes shared by the engine tests

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use wled_client::{ClientError, DeviceApi, Identity};
use wled_core::{DeviceId, DeviceStateInfo, DeviceStore, Info, MemoryStore, NewDevice};

use crate::events::DeviceEvent;
use crate::probe::{Probe, ProbeFailure, ProbeOutcome};
use crate::reconcile::Reconciler;
use crate::request::{RequestConfig, RequestRegistry, SharedStore};

const STATE_INFO: &str = r#"{"state":{"on":true,"bri":128,"seg":[{"col":[[255,0,0]]}]},"info":{"name":"Fake","ver":"0.15.0","brand":"WLED"}}"#;

/// Store holding one offline device at `address`
pub async fn device_store(address: &str) -> (SharedStore, DeviceId) {
    let mut store = MemoryStore::new();
    let record = store.create(NewDevice {
        address: address.to_string(),
        name: "Fake".to_string(),
        ..Default::default()
    });
    let store: SharedStore = Arc::new(Mutex::new(store));
    (store, record.id)
}

pub fn empty_store() -> SharedStore {
    Arc::new(Mutex::new(MemoryStore::new()))
}

/// Reconciler over `store` backed by `api`, plus an event receiver
pub fn reconciler(
    api: Arc<FakeApi>,
    store: SharedStore,
) -> (Arc<Reconciler>, broadcast::Receiver<DeviceEvent>) {
    let (events, rx) = broadcast::channel(256);
    let requests = Arc::new(RequestRegistry::new(
        api,
        store.clone(),
        events.clone(),
        RequestConfig::default(),
    ));
    (Arc::new(Reconciler::new(store, requests, events)), rx)
}

/// Device API that records calls and concurrency
pub struct FakeApi {
    pub refresh_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub entered: Notify,
    pub release: Notify,
    pub firmware: Mutex<Vec<Vec<u8>>>,
    delay: Duration,
    gated: bool,
    fail_first: usize,
    rejected: HashSet<String>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
            firmware: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            gated: false,
            fail_first: 0,
            rejected: HashSet::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block each call until `release` is notified
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    /// Fail identity checks for `address`
    pub fn rejecting(mut self, address: &str) -> Self {
        self.rejected.insert(address.to_string());
        self
    }

    async fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.entered.notify_one();
        if self.gated {
            self.release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceApi for FakeApi {
    async fn verify(&self, address: &str) -> Result<Identity, ClientError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.rejected.contains(address) {
            return Err(ClientError::Status(404));
        }
        Ok(Identity::from_info(Info {
            name: Some(format!("WLED {}", address)),
            version: Some("0.15.0".to_string()),
            brand: Some("WLED".to_string()),
            ..Default::default()
        }))
    }

    async fn refresh(&self, _address: &str) -> Result<DeviceStateInfo, ClientError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        self.leave();
        if call < self.fail_first {
            return Err(ClientError::Network("connection reset".to_string()));
        }
        serde_json::from_str(STATE_INFO).map_err(|e| ClientError::Schema(e.to_string()))
    }

    async fn push_firmware(&self, _address: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.enter().await;
        self.leave();
        self.firmware.lock().await.push(payload);
        Ok(())
    }
}

/// Probe that confirms a fixed set of addresses and counts calls
pub struct FakeProbe {
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    devices: HashSet<String>,
    delay: Duration,
}

impl FakeProbe {
    pub fn new(devices: &[&str]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            devices: devices.iter().map(|d| d.to_string()).collect(),
            delay: Duration::from_millis(1),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.devices.contains(address) {
            let identity = Identity::from_info(Info {
                name: Some(format!("WLED {}", address)),
                version: Some("0.14.4".to_string()),
                brand: Some("WLED".to_string()),
                ..Default::default()
            });
            ProbeOutcome::confirmed(address, &identity)
        } else {
            ProbeOutcome::unreachable(address, ProbeFailure::Timeout)
        }
    }
}
