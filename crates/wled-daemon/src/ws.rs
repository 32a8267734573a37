//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use wled_core::DeviceRecord;
use wled_discovery::{DeviceEvent, ProbeOutcome, ScanEvent, ScanProgress, ScanState};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "devices")]
    Devices(Vec<DeviceRecord>),
    #[serde(rename = "device_created")]
    DeviceCreated(DeviceRecord),
    #[serde(rename = "device_updated")]
    DeviceUpdated(DeviceRecord),
    #[serde(rename = "device_removed")]
    DeviceRemoved { id: String },
    #[serde(rename = "scan_progress")]
    ScanProgress(ScanProgress),
    #[serde(rename = "scan_started")]
    ScanStarted { spec: String, total: usize },
    #[serde(rename = "scan_device_found")]
    ScanDeviceFound(ProbeOutcome),
    #[serde(rename = "scan_finished")]
    ScanFinished {
        state: ScanState,
        checked: usize,
        found: usize,
    },
    #[serde(rename = "pong")]
    Pong,
}

impl From<DeviceEvent> for WsMessage {
    fn from(event: DeviceEvent) -> Self {
        match event {
            DeviceEvent::Created(device) => WsMessage::DeviceCreated(device),
            DeviceEvent::Updated(device) => WsMessage::DeviceUpdated(device),
            DeviceEvent::Removed(id) => WsMessage::DeviceRemoved { id: id.0 },
        }
    }
}

impl From<ScanEvent> for WsMessage {
    fn from(event: ScanEvent) -> Self {
        match event {
            ScanEvent::Started { spec, total } => WsMessage::ScanStarted { spec, total },
            ScanEvent::DeviceFound(outcome) => WsMessage::ScanDeviceFound(outcome),
            ScanEvent::Finished {
                state,
                checked,
                found,
            } => WsMessage::ScanFinished {
                state,
                checked,
                found,
            },
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;

/// Serialize and send; false once the client is gone
async fn send(sender: &mut WsSender, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket message");
            true
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut device_events = state.subscribe();
    let mut scan_events = state.scanner.subscribe();
    let mut progress = state.scanner.watch();

    info!("WebSocket client connected");

    // Current picture on connect
    if !send(&mut sender, &WsMessage::Devices(state.devices().await)).await {
        return;
    }
    let snapshot = progress.borrow_and_update().clone();
    if !send(&mut sender, &WsMessage::ScanProgress(snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            event = device_events.recv() => {
                match event {
                    Ok(event) => {
                        if !send(&mut sender, &event.into()).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Device event channel lagged");
                        // Resync with a full list
                        if !send(&mut sender, &WsMessage::Devices(state.devices().await)).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            event = scan_events.recv() => {
                match event {
                    Ok(event) => {
                        if !send(&mut sender, &event.into()).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Scan event channel lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = progress.borrow_and_update().clone();
                if !send(&mut sender, &WsMessage::ScanProgress(snapshot)).await {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" && !send(&mut sender, &WsMessage::Pong).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
