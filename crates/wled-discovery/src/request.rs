//! Per-device request queues
//!
//! Every device gets one worker task fed by an unbounded FIFO channel, so at
//! most one request runs against a device at a time and requests execute in
//! enqueue order. Firmware uploads share the slot with refreshes: the device
//! serves both from one HTTP server and reboots after an update.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wled_client::{ClientError, DeviceApi};
use wled_core::{DeviceId, DeviceRecord, DeviceStore};

use crate::events::DeviceEvent;

/// Store shared between the reconciler and the request workers
pub type SharedStore = Arc<Mutex<dyn DeviceStore>>;

/// Default time budget for one refresh in milliseconds
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Device request failed: {0}")]
    Client(#[from] ClientError),
    #[error("Device request timed out")]
    Timeout,
    #[error("Device not found: {0}")]
    DeviceMissing(DeviceId),
    #[error("Request queue closed")]
    ManagerClosed,
}

/// Work that can be queued against a device
#[derive(Debug, Clone)]
pub enum DeviceRequest {
    /// Pull state and info, updating the record's runtime fields
    Refresh,
    /// Push a firmware image
    SoftwareUpdate { payload: Vec<u8> },
}

impl DeviceRequest {
    fn label(&self) -> &'static str {
        match self {
            DeviceRequest::Refresh => "refresh",
            DeviceRequest::SoftwareUpdate { .. } => "software_update",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", content = "device", rename_all = "snake_case")]
pub enum RequestOutcome {
    Refreshed(DeviceRecord),
    Updated(DeviceId),
}

/// Completion handle returned by `enqueue`
///
/// Dropping the handle does not cancel the request.
#[derive(Debug)]
pub struct RequestHandle {
    reply: oneshot::Receiver<Result<RequestOutcome, RequestError>>,
}

impl RequestHandle {
    pub async fn wait(self) -> Result<RequestOutcome, RequestError> {
        self.reply.await.unwrap_or(Err(RequestError::ManagerClosed))
    }
}

struct PendingRequest {
    request: DeviceRequest,
    reply: oneshot::Sender<Result<RequestOutcome, RequestError>>,
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub refresh_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_millis(DEFAULT_REFRESH_TIMEOUT_MS),
        }
    }
}

/// What a worker needs to execute requests
struct Executor {
    api: Arc<dyn DeviceApi>,
    store: SharedStore,
    events: broadcast::Sender<DeviceEvent>,
    config: RequestConfig,
}

impl Executor {
    async fn execute(
        &self,
        device: &DeviceId,
        request: DeviceRequest,
    ) -> Result<RequestOutcome, RequestError> {
        match request {
            DeviceRequest::Refresh => self.refresh(device).await,
            DeviceRequest::SoftwareUpdate { payload } => self.update(device, payload).await,
        }
    }

    async fn refresh(&self, device: &DeviceId) -> Result<RequestOutcome, RequestError> {
        let address = {
            let mut store = self.store.lock().await;
            store
                .update(device, &mut |d| d.is_refreshing = true)
                .map(|d| d.address)
                .ok_or_else(|| RequestError::DeviceMissing(device.clone()))?
        };

        let result = match timeout(self.config.refresh_timeout, self.api.refresh(&address)).await {
            Ok(Ok(state_info)) => Ok(state_info),
            Ok(Err(e)) => Err(RequestError::Client(e)),
            Err(_) => Err(RequestError::Timeout),
        };

        let updated = {
            let mut store = self.store.lock().await;
            let updated = store.update(device, &mut |d| {
                d.is_refreshing = false;
                match &result {
                    Ok(state_info) => d.apply_state(state_info),
                    Err(_) => d.is_online = false,
                }
            });
            if let Err(e) = store.save() {
                warn!(device = %device, error = %e, "Failed to persist refresh result");
            }
            updated
        };

        // Removed while the refresh was in flight
        let record = updated.ok_or_else(|| RequestError::DeviceMissing(device.clone()))?;
        let _ = self.events.send(DeviceEvent::Updated(record.clone()));

        match result {
            Ok(_) => Ok(RequestOutcome::Refreshed(record)),
            Err(e) => {
                debug!(device = %device, address = %address, error = %e, "Device marked offline");
                Err(e)
            }
        }
    }

    async fn update(
        &self,
        device: &DeviceId,
        payload: Vec<u8>,
    ) -> Result<RequestOutcome, RequestError> {
        let address = {
            let store = self.store.lock().await;
            store
                .get(device)
                .map(|d| d.address)
                .ok_or_else(|| RequestError::DeviceMissing(device.clone()))?
        };

        self.api.push_firmware(&address, payload).await?;
        info!(device = %device, address = %address, "Software update delivered");
        Ok(RequestOutcome::Updated(device.clone()))
    }
}

/// Queue and worker for one device
struct RequestManager {
    queue: mpsc::UnboundedSender<PendingRequest>,
}

impl RequestManager {
    fn spawn(device: DeviceId, executor: Arc<Executor>) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<PendingRequest>();

        tokio::spawn(async move {
            while let Some(PendingRequest { request, reply }) = pending.recv().await {
                let label = request.label();
                debug!(device = %device, request = label, "Executing request");

                let result = executor.execute(&device, request).await;
                if let Err(e) = &result {
                    debug!(device = %device, request = label, error = %e, "Request failed");
                }
                let _ = reply.send(result);
            }
            debug!(device = %device, "Request queue closed");
        });

        Self { queue }
    }

    fn enqueue(&self, request: DeviceRequest) -> Result<RequestHandle, DeviceRequest> {
        let (reply, handle) = oneshot::channel();
        self.queue
            .send(PendingRequest { request, reply })
            .map(|_| RequestHandle { reply: handle })
            .map_err(|e| e.0.request)
    }
}

/// Request managers keyed by device
pub struct RequestRegistry {
    executor: Arc<Executor>,
    managers: Mutex<HashMap<DeviceId, RequestManager>>,
}

impl RequestRegistry {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        store: SharedStore,
        events: broadcast::Sender<DeviceEvent>,
        config: RequestConfig,
    ) -> Self {
        Self {
            executor: Arc::new(Executor {
                api,
                store,
                events,
                config,
            }),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a request to the device's queue; it starts immediately when the
    /// queue is idle
    pub async fn enqueue(&self, device: &DeviceId, request: DeviceRequest) -> RequestHandle {
        let mut managers = self.managers.lock().await;

        let request = match managers.get(device) {
            Some(manager) => match manager.enqueue(request) {
                Ok(handle) => return handle,
                Err(request) => request,
            },
            None => request,
        };
        // No manager yet, or its worker has gone away
        let manager = RequestManager::spawn(device.clone(), Arc::clone(&self.executor));
        let handle = match manager.enqueue(request) {
            Ok(handle) => handle,
            Err(_) => closed_handle(),
        };
        managers.insert(device.clone(), manager);
        handle
    }

    pub async fn refresh(&self, device: &DeviceId) -> RequestHandle {
        self.enqueue(device, DeviceRequest::Refresh).await
    }

    /// Refresh every stored device that is not already refreshing
    pub async fn refresh_all(&self) -> Vec<RequestHandle> {
        let ids: Vec<DeviceId> = {
            let store = self.executor.store.lock().await;
            store
                .list()
                .into_iter()
                .filter(|d| !d.is_refreshing)
                .map(|d| d.id)
                .collect()
        };
        debug!(count = ids.len(), "Refreshing all devices");

        let mut handles = Vec::with_capacity(ids.len());
        for id in &ids {
            handles.push(self.refresh(id).await);
        }
        handles
    }

    /// Drop a device's queue; already queued requests still run
    pub async fn remove(&self, device: &DeviceId) {
        self.managers.lock().await.remove(device);
    }
}

fn closed_handle() -> RequestHandle {
    let (reply, handle) = oneshot::channel();
    let _ = reply.send(Err(RequestError::ManagerClosed));
    RequestHandle { reply: handle }
}
