/**
 * HTTP API - REST endpoints and WebSocket channels of the kernel
 *
 * ROLE: thin layer over `Kernel`. Every handler delegates; no device logic here.
 *
 * ROUTES:
 * - /health (always open), /system/health
 * - /devices, /devices/scan, /devices/status, /devices/{id}/status,
 *   /devices/request-status, /devices/{id}/command
 * - /settings/status-updates, /settings/extended-interval/{minutes}
 * - /ws/{channel}?initial_status=true
 *
 * SECURITY: when an API key is configured, every route except /health needs a
 * matching `x-api-key` header.
 */

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcaster::describe_interval;
use crate::commands::CommandParams;
use crate::error::CommandError;
use crate::events::KernelEvent;
use crate::kernel::Kernel;
use crate::models::DeviceStatus;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Kernel,
    pub api_key: Option<Arc<str>>,
    /// Outbound queue length per WebSocket client.
    pub ws_queue: usize,
}

impl AppState {
    pub fn new(kernel: Kernel, api_key: Option<String>, ws_queue: usize) -> Self {
        Self {
            kernel,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
            ws_queue: ws_queue.max(1),
        }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!("[http] rejected {} without a valid API key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/scan", post(scan_devices))
        .route("/devices/status", get(get_all_status))
        .route("/devices/request-status", post(request_status))
        .route("/devices/{id}/status", get(get_device_status))
        .route("/devices/{id}/command", post(execute_command))
        .route(
            "/settings/status-updates",
            get(get_status_updates).post(set_status_updates),
        )
        .route("/settings/extended-interval/{minutes}", post(set_extended_interval))
        .route("/ws/{channel}", get(ws_handler))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(json!({ "error": message.into() }))).into_response()
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    Json(app.kernel.health())
}

// GET /devices
async fn get_devices(State(app): State<AppState>) -> Json<serde_json::Value> {
    let devices = app.kernel.list_devices().await;
    Json(json!({ "count": devices.len(), "devices": devices }))
}

// POST /devices/scan
async fn scan_devices(State(app): State<AppState>) -> Json<serde_json::Value> {
    let devices = app.kernel.scan_devices().await;
    Json(json!({ "count": devices.len(), "devices": devices }))
}

// GET /devices/status
async fn get_all_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let statuses = app.kernel.all_statuses().await;
    Json(json!({ "devices_status": statuses }))
}

// POST /devices/request-status
async fn request_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let statuses = app.kernel.broadcaster.request_full_refresh().await;
    Json(json!({
        "status": "success",
        "message": format!("Status updated for {} devices", statuses.len()),
    }))
}

#[derive(Serialize)]
struct TimestampedStatus {
    #[serde(flatten)]
    status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

// GET /devices/{id}/status (full check)
async fn get_device_status(State(app): State<AppState>, Path(id): Path<String>) -> Json<TimestampedStatus> {
    Json(TimestampedStatus {
        status: app.kernel.device_status(&id, true).await,
        timestamp: OffsetDateTime::now_utc(),
    })
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    parameters: CommandParams,
}

// POST /devices/{id}/command
async fn execute_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    match app.kernel.execute_command(&id, &req.command, &req.parameters).await {
        Ok(outcome) => Json(json!({
            "device_id": id,
            "command": req.command,
            "success": outcome.success,
            "message": outcome.message,
        }))
        .into_response(),
        Err(e @ CommandError::UnknownAction(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StatusUpdateSettings {
    #[serde(default)]
    automatic: bool,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    900
}

// GET /settings/status-updates
async fn get_status_updates(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "config": app.kernel.broadcaster.config() }))
}

// POST /settings/status-updates
async fn set_status_updates(
    State(app): State<AppState>,
    Json(req): Json<StatusUpdateSettings>,
) -> Json<serde_json::Value> {
    let cfg = app.kernel.broadcaster.set_config(req.automatic, req.interval);
    let message = format!(
        "Automatic status updates {}, interval set to {}",
        if cfg.automatic { "enabled" } else { "disabled" },
        describe_interval(cfg.interval)
    );
    Json(json!({ "status": "success", "message": message, "config": cfg }))
}

// POST /settings/extended-interval/{minutes}
async fn set_extended_interval(State(app): State<AppState>, Path(minutes): Path<u64>) -> Json<serde_json::Value> {
    let cfg = app.kernel.broadcaster.set_extended_interval(minutes);
    let message = format!(
        "Extended update interval set to {}, automatic updates disabled",
        describe_interval(cfg.interval)
    );
    Json(json!({ "status": "success", "message": message, "config": cfg }))
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    initial_status: bool,
}

// GET /ws/{channel}
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    Query(params): Query<WsParams>,
    State(app): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, channel, params.initial_status, app))
}

/// Messages a WebSocket client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ScanDevices,
    GetStatus,
    GetDeviceStatus {
        device_id: String,
    },
    ExecuteCommand {
        device_id: String,
        command: String,
        #[serde(default)]
        parameters: CommandParams,
    },
}

async fn client_session(socket: WebSocket, channel: String, initial_status: bool, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (handle, broadcasts) =
        app.kernel
            .bus
            .subscribe_queue(&channel, format!("ws:{}", channel), app.ws_queue);
    let (reply_tx, replies) = mpsc::channel::<KernelEvent>(app.ws_queue);
    info!("[ws] client joined '{}'", channel);

    // Single writer: bus broadcasts and direct replies share the socket.
    let mut writer = tokio::spawn(async move { forward_events(broadcasts, replies, &mut sink).await });

    let devices = app.kernel.list_devices().await;
    let _ = reply_tx.send(KernelEvent::device_list(devices)).await;
    if initial_status {
        let statuses = app.kernel.all_statuses().await;
        let _ = reply_tx.send(KernelEvent::status_update(statuses, false)).await;
    }

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut writer => break,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_client_message(&app.kernel, text.as_str()).await {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    app.kernel.bus.unsubscribe(&handle);
    writer.abort();
    info!("[ws] client left '{}'", channel);
}

/// Writes bus broadcasts and direct replies to one socket until the socket
/// fails. Once the bus drops the client (its queue overflowed), the client gets
/// a close frame so it can reconnect.
pub async fn forward_events<S>(
    mut broadcasts: mpsc::Receiver<KernelEvent>,
    mut replies: mpsc::Receiver<KernelEvent>,
    sink: &mut S,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let event = tokio::select! {
            broadcast = broadcasts.recv() => match broadcast {
                Some(event) => event,
                None => {
                    debug!("[ws] client dropped by the bus, closing socket");
                    let frame = CloseFrame {
                        code: close_code::AGAIN,
                        reason: "client lagging".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return;
                }
            },
            Some(event) = replies.recv() => event,
        };
        let Ok(text) = event.to_json() else { continue };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}

/// Answers one client message. Command results are not answered here: they
/// reach the client through the bus like every other subscriber.
pub async fn handle_client_message(kernel: &Kernel, text: &str) -> Option<KernelEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("[ws] invalid JSON from client: {}", e);
            return None;
        }
    };
    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => return Some(KernelEvent::error(format!("unsupported message: {}", e))),
    };
    debug!("[ws] {:?}", message);

    match message {
        ClientMessage::ScanDevices => Some(KernelEvent::device_list(kernel.list_devices().await)),
        ClientMessage::GetStatus => Some(KernelEvent::status_update(kernel.all_statuses().await, false)),
        ClientMessage::GetDeviceStatus { device_id } => {
            let status = kernel.device_status(&device_id, false).await;
            Some(KernelEvent::DeviceStatus {
                device_id,
                status,
                timestamp: OffsetDateTime::now_utc(),
            })
        }
        ClientMessage::ExecuteCommand {
            device_id,
            command,
            parameters,
        } => match kernel.execute_command(&device_id, &command, &parameters).await {
            Ok(_) => None,
            Err(e) => Some(KernelEvent::error(e.to_string())),
        },
    }
}
