//! Application state and component wiring

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use wled_client::WledClient;
use wled_core::{DeviceId, DeviceRecord, JsonStore};
use wled_discovery::{
    DeviceEvent, DeviceProber, DiscoveryListener, MdnsBrowser, Reconciler, RequestRegistry,
    SharedStore, SubnetScanner,
};

use crate::config::Config;

/// Shared application state
pub struct AppState {
    pub config: Config,
    /// Device store, shared by the reconciler and the request workers
    pub store: SharedStore,
    pub requests: Arc<RequestRegistry>,
    pub reconciler: Arc<Reconciler>,
    pub scanner: Arc<SubnetScanner>,
    /// Passive mDNS discovery, absent when disabled or unavailable
    pub listener: Option<Arc<DiscoveryListener>>,
    /// Device events for WebSocket clients
    pub events: broadcast::Sender<DeviceEvent>,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = JsonStore::open(&config.daemon.store_path)?;
        let store: SharedStore = Arc::new(Mutex::new(store));

        let client = Arc::new(WledClient::new(config.to_client_config())?);
        let (events, _) = broadcast::channel(256);

        let requests = Arc::new(RequestRegistry::new(
            client.clone(),
            store.clone(),
            events.clone(),
            config.to_request_config(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            requests.clone(),
            events.clone(),
        ));

        let prober = Arc::new(DeviceProber::new(
            client.clone(),
            config.device.http_port,
            config.connect_timeout(),
        ));
        let scanner = Arc::new(SubnetScanner::new(
            prober,
            reconciler.clone(),
            config.to_scan_config(),
        ));

        let listener = if config.discovery.mdns_enabled {
            match MdnsBrowser::new() {
                Ok(browser) => Some(Arc::new(
                    DiscoveryListener::new(
                        Arc::new(browser),
                        client.clone(),
                        reconciler.clone(),
                        &config.discovery.service_type,
                    )
                    .with_connect_timeout(config.connect_timeout()),
                )),
                Err(e) => {
                    warn!(error = %e, "mDNS unavailable, passive discovery disabled");
                    None
                }
            }
        } else {
            info!("Passive discovery disabled by configuration");
            None
        };

        Ok(Arc::new(Self {
            config,
            store,
            requests,
            reconciler,
            scanner,
            listener,
            events,
        }))
    }

    /// Start passive discovery and the periodic refresh loop
    pub async fn start_background(self: &Arc<Self>) {
        if let Some(listener) = &self.listener {
            if let Err(e) = listener.start().await {
                warn!(error = %e, "Failed to start discovery listener");
            }
        }

        // Bring persisted devices up to date right away
        self.requests.refresh_all().await;

        let interval_secs = self.config.daemon.refresh_interval_secs;
        if interval_secs == 0 {
            info!("Periodic refresh disabled");
            return;
        }

        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let queued = state.requests.refresh_all().await.len();
                debug!(queued, "Periodic refresh");
            }
        });
    }

    /// All devices, ordered by name
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices = self.store.lock().await.list();
        devices.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        devices
    }

    pub async fn get_device(&self, id: &str) -> Option<DeviceRecord> {
        self.store.lock().await.get(&DeviceId::from(id))
    }

    /// Subscribe to device events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
