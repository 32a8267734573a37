//! REST API handlers

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};
use wled_core::DeviceId;
use wled_discovery::{
    DeviceRequest, ReconcileError, RequestError, RequestOutcome, ScanError,
};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Device not found")
}

fn reconcile_error(e: ReconcileError) -> Response {
    let status = match &e {
        ReconcileError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
        ReconcileError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn request_error(e: RequestError) -> Response {
    let status = match &e {
        RequestError::DeviceMissing(_) => StatusCode::NOT_FOUND,
        RequestError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RequestError::Client(_) => StatusCode::BAD_GATEWAY,
        RequestError::ManagerClosed => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e.to_string())
}

/// List all known devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.devices().await)
}

/// Get a specific device by ID
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.get_device(&id).await {
        Some(device) => Json(device).into_response(),
        None => not_found(),
    }
}

/// Manual add request body
#[derive(Deserialize)]
pub struct AddDeviceRequest {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Add a device by address
pub async fn add_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDeviceRequest>,
) -> impl IntoResponse {
    info!(address = %req.address, "Manual device add requested");

    match state
        .reconciler
        .add_manual(&req.address, req.name.as_deref(), req.hidden)
        .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome.record().clone())).into_response(),
        Err(e) => reconcile_error(e),
    }
}

/// Edit request body; absent fields are left alone
#[derive(Deserialize)]
pub struct EditDeviceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hidden: Option<bool>,
}

/// Rename and/or hide a device
pub async fn edit_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<EditDeviceRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    let mut record = match state.get_device(id.as_str()).await {
        Some(record) => record,
        None => return not_found(),
    };

    if let Some(name) = &req.name {
        match state.reconciler.rename(&id, name).await {
            Ok(updated) => record = updated,
            Err(e) => return reconcile_error(e),
        }
    }
    if let Some(hidden) = req.hidden {
        match state.reconciler.set_hidden(&id, hidden).await {
            Ok(updated) => record = updated,
            Err(e) => return reconcile_error(e),
        }
    }

    Json(record).into_response()
}

/// Remove a device from the store
pub async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!(device = %id, "Remove device requested");

    match state.reconciler.remove(&DeviceId::from(id.as_str())).await {
        Ok(()) => Json(serde_json::json!({
            "status": "removed",
            "device_id": id
        }))
        .into_response(),
        Err(e) => reconcile_error(e),
    }
}

/// Refresh one device and return its updated record
pub async fn refresh_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    if state.get_device(id.as_str()).await.is_none() {
        return not_found();
    }

    match state.requests.refresh(&id).await.wait().await {
        Ok(RequestOutcome::Refreshed(record)) => Json(record).into_response(),
        Ok(RequestOutcome::Updated(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => request_error(e),
    }
}

/// Queue a refresh for every device
pub async fn refresh_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queued = state.requests.refresh_all().await.len();
    debug!(queued, "Refresh of all devices requested");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": queued })),
    )
}

/// Push a firmware image (raw request body) to a device
pub async fn update_firmware(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    if state.get_device(id.as_str()).await.is_none() {
        return not_found();
    }
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Firmware payload is empty");
    }

    info!(device = %id, bytes = body.len(), "Software update requested");
    let request = DeviceRequest::SoftwareUpdate {
        payload: body.to_vec(),
    };
    match state.requests.enqueue(&id, request).await.wait().await {
        Ok(_) => Json(serde_json::json!({
            "status": "updated",
            "device_id": id
        }))
        .into_response(),
        Err(e) => request_error(e),
    }
}

/// Scan request body
#[derive(Deserialize)]
pub struct ScanRequest {
    /// Network spec; falls back to the configured default subnet
    #[serde(default)]
    pub spec: Option<String>,
}

/// Start a subnet scan
pub async fn start_scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let spec = req
        .spec
        .filter(|s| !s.trim().is_empty())
        .or_else(|| state.config.discovery.default_subnet.clone())
        .unwrap_or_default();

    match state.scanner.start_scan(&spec).await {
        Ok(total) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "scanning",
                "spec": spec,
                "total": total
            })),
        )
            .into_response(),
        Err(e @ ScanError::InvalidInput(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ ScanError::AlreadyScanning) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

/// Cancel the running scan
pub async fn stop_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopping = state.scanner.stop_scan().await;
    Json(serde_json::json!({ "stopping": stopping }))
}

/// Current scan progress
pub async fn get_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scanner.progress())
}

/// Selection of scan hits to add
#[derive(Deserialize)]
pub struct AddScanResultsRequest {
    pub addresses: Vec<String>,
}

/// Add selected hits of the latest scan to the store
pub async fn add_scan_results(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddScanResultsRequest>,
) -> impl IntoResponse {
    let added = state.scanner.add_selected(&req.addresses).await;
    Json(serde_json::json!({ "added": added }))
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

/// Network interface info for the UI
#[derive(Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub subnet: String,
    pub prefix_len: u8,
    /// Scan spec covering this interface's neighbourhood
    pub suggested_spec: String,
}

/// Scan spec for an interface: its own network, narrowed to the surrounding
/// /24 when the network is larger than a scan can cover
pub fn suggested_spec(ip: Ipv4Addr, prefix: u8) -> String {
    let prefix = prefix.clamp(24, 30);
    let mask = !0u32 << (32 - prefix);
    format!("{}/{}", Ipv4Addr::from(u32::from(ip) & mask), prefix)
}

/// List available network interfaces
pub async fn list_interfaces() -> impl IntoResponse {
    use network_interface::{NetworkInterface as NI, NetworkInterfaceConfig};

    let interfaces: Vec<NetworkInterface> = NI::show()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|iface| {
            iface.addr.iter().find_map(|addr| {
                if let network_interface::Addr::V4(v4) = addr {
                    let ip = v4.ip;
                    let prefix = v4
                        .netmask
                        .map(|m| u32::from(m).count_ones() as u8)
                        .unwrap_or(24);
                    let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
                    let subnet = Ipv4Addr::from(u32::from(ip) & mask);

                    Some(NetworkInterface {
                        name: iface.name.clone(),
                        ip: ip.to_string(),
                        subnet: subnet.to_string(),
                        prefix_len: prefix,
                        suggested_spec: suggested_spec(ip, prefix),
                    })
                } else {
                    None
                }
            })
        })
        .filter(|iface| {
            !iface.name.starts_with("lo")
                && !iface.name.starts_with("docker")
                && !iface.name.starts_with("br-")
                && !iface.name.starts_with("veth")
                && iface.ip != "127.0.0.1"
        })
        .collect();

    Json(interfaces)
}
