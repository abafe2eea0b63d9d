use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::control::{parse_command, ControlPlane, ScheduleRequest, ScheduleUpdate};
use crate::db::{Db, HistoryRange};
use crate::error::GatewayResult;
use crate::fanout::Fanout;
use crate::live::{LiveReading, LiveState};
use crate::model::{DeviceStatus, DeviceType, Mode, ModePatch, ScheduleFilter, SensorConfigPatch, SensorKind};
use crate::publisher::CommandTransport;
use crate::scheduler::Execution;
use crate::state::{SharedState, StatusResponse};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState<T> {
    pub db: Db,
    pub shared: SharedState,
    pub live: Arc<LiveState>,
    pub control: Arc<ControlPlane<Db, T>>,
    pub fanout: Fanout,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            shared: self.shared.clone(),
            live: self.live.clone(),
            control: self.control.clone(),
            fanout: self.fanout.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<T: CommandTransport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<T>))
        .route("/api/sensors/current", get(sensors_current::<T>))
        .route("/api/sensors/history", get(sensors_history::<T>))
        .route("/api/telemetry", get(telemetry::<T>))
        .route("/api/device-modes", get(list_modes::<T>))
        .route("/api/device-modes/sync-all", post(sync_all::<T>))
        .route("/api/device-modes/sync-toggle", patch(sync_toggle::<T>))
        .route(
            "/api/device-modes/{device}",
            get(get_mode::<T>).put(put_mode::<T>),
        )
        .route("/api/device-modes/{device}/mode", patch(patch_mode::<T>))
        .route(
            "/api/device-modes/{device}/sensor-config",
            patch(patch_sensor_config::<T>),
        )
        .route(
            "/api/device-modes/{device}/restart-sensor",
            post(restart_sensor::<T>),
        )
        .route("/api/device-modes/{device}/check", post(check_sensor::<T>))
        .route(
            "/api/schedules",
            get(list_schedules::<T>).post(create_schedule::<T>),
        )
        .route("/api/schedules/next-runs/today", get(runs_today::<T>))
        .route(
            "/api/schedules/{id}",
            get(get_schedule::<T>)
                .put(update_schedule::<T>)
                .delete(delete_schedule::<T>),
        )
        .route("/api/schedules/{id}/toggle", patch(toggle_schedule::<T>))
        .route("/api/schedules/{id}/test-run", post(test_run::<T>))
        .route("/api/control", post(control::<T>))
        .route("/ws", get(ws_handler::<T>))
        .with_state(state)
}

fn device(name: &str) -> GatewayResult<DeviceType> {
    Ok(DeviceType::from_str(name)?)
}

// -- status & sensors ---------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(flatten)]
    system: StatusResponse,
    sensors: BTreeMap<SensorKind, CurrentReading>,
    devices: BTreeMap<DeviceType, DeviceStatus>,
    sensor_monitors: Vec<DeviceType>,
    scheduler_running: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentReading {
    #[serde(flatten)]
    reading: LiveReading,
    stale: bool,
}

async fn current_readings(live: &LiveState) -> BTreeMap<SensorKind, CurrentReading> {
    let now = OffsetDateTime::now_utc();
    live.readings()
        .await
        .into_iter()
        .map(|(kind, reading)| {
            let stale = reading.is_stale(now);
            (kind, CurrentReading { reading, stale })
        })
        .collect()
}

async fn api_status<T: CommandTransport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let system = state.shared.read().await.to_status();
    Json(StatusBody {
        system,
        sensors: current_readings(&state.live).await,
        devices: state.live.statuses().await.into_iter().collect(),
        sensor_monitors: state.control.sensors().monitored(),
        scheduler_running: state.control.scheduler().is_running(),
    })
}

async fn sensors_current<T: CommandTransport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(current_readings(&state.live).await)
}

#[derive(Deserialize)]
struct HistoryQuery {
    range: Option<String>,
}

async fn sensors_history<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Query(q): Query<HistoryQuery>,
) -> GatewayResult<impl IntoResponse> {
    let range = match q.range.as_deref() {
        Some(r) => HistoryRange::from_str(r)?,
        None => HistoryRange::default(),
    };
    let samples = state.db.sensor_history(range, OffsetDateTime::now_utc()).await?;
    Ok(Json(samples))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryQuery {
    page: Option<i64>,
    limit: Option<i64>,
    device_id: Option<String>,
}

async fn telemetry<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Query(q): Query<TelemetryQuery>,
) -> GatewayResult<impl IntoResponse> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = q.page.unwrap_or(1).max(1);
    let rows = state
        .db
        .recent_telemetry(q.device_id.as_deref(), limit, (page - 1) * limit)
        .await?;
    Ok(Json(json!({ "page": page, "limit": limit, "items": rows })))
}

// -- device modes -------------------------------------------------------------

#[derive(Deserialize)]
struct ModeBody {
    mode: Mode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncToggleBody {
    sync_mode: bool,
}

async fn list_modes<T: CommandTransport>(
    State(state): State<AppState<T>>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.device_modes().await?))
}

async fn get_mode<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.device_mode(device(&name)?).await?))
}

async fn put_mode<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    Json(body): Json<ModePatch>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.update_device_mode(device(&name)?, body).await?))
}

async fn patch_mode<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    Json(body): Json<ModeBody>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.switch_mode(device(&name)?, body.mode).await?))
}

async fn patch_sensor_config<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    Json(body): Json<SensorConfigPatch>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.update_sensor_config(device(&name)?, body).await?))
}

async fn restart_sensor<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.restart_sensor(device(&name)?).await?))
}

async fn check_sensor<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.check_sensor(device(&name)?).await?))
}

async fn sync_all<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Json(body): Json<ModeBody>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.sync_all(body.mode).await?))
}

async fn sync_toggle<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Json(body): Json<SyncToggleBody>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.set_sync_mode(body.sync_mode).await?))
}

// -- schedules ----------------------------------------------------------------

async fn list_schedules<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Query(filter): Query<ScheduleFilter>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.list_schedules(&filter).await?))
}

async fn create_schedule<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Json(body): Json<ScheduleRequest>,
) -> GatewayResult<impl IntoResponse> {
    let entry = state.control.create_schedule(body).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_schedule<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(id): Path<i64>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.schedule(id).await?))
}

async fn update_schedule<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(id): Path<i64>,
    Json(body): Json<ScheduleUpdate>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.update_schedule(id, body).await?))
}

async fn delete_schedule<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(id): Path<i64>,
) -> GatewayResult<impl IntoResponse> {
    state.control.delete_schedule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_schedule<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(id): Path<i64>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.toggle_schedule(id).await?))
}

async fn test_run<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Path(id): Path<i64>,
) -> GatewayResult<impl IntoResponse> {
    let body = match state.control.test_run(id).await? {
        Execution::Executed(entry) => json!({ "executed": true, "schedule": entry }),
        Execution::Skipped { mode } => json!({ "executed": false, "mode": mode }),
    };
    Ok(Json(body))
}

async fn runs_today<T: CommandTransport>(
    State(state): State<AppState<T>>,
) -> GatewayResult<impl IntoResponse> {
    Ok(Json(state.control.runs_today().await?))
}

// -- manual control -----------------------------------------------------------

async fn control<T: CommandTransport>(
    State(state): State<AppState<T>>,
    Json(cmd): Json<Value>,
) -> GatewayResult<impl IntoResponse> {
    let (device, action) = parse_command(&cmd)?;
    state.control.manual_command(device, action).await?;
    Ok(Json(json!({ "ok": true, "deviceType": device, "action": action })))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ViewerMessage {
    Control { cmd: Value },
}

/// Answer one text frame from a viewer.
async fn viewer_reply<T: CommandTransport>(control: &ControlPlane<Db, T>, text: &str) -> Value {
    let cmd = match serde_json::from_str::<ViewerMessage>(text) {
        Ok(ViewerMessage::Control { cmd }) => cmd,
        Err(e) => return json!({ "type": "error", "error": format!("bad message: {e}") }),
    };
    let outcome = match parse_command(&cmd) {
        Ok((device, action)) => control
            .manual_command(device, action)
            .await
            .map(|()| (device, action)),
        Err(e) => Err(e.into()),
    };
    match outcome {
        Ok((device, action)) => json!({ "type": "ok", "deviceType": device, "action": action }),
        Err(e) => json!({ "type": "error", "error": e.to_string() }),
    }
}

async fn ws_handler<T: CommandTransport>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<T>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json<S: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &S,
) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn handle_socket<T: CommandTransport>(socket: WebSocket, state: AppState<T>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.fanout.subscribe();

    if send_json(&mut sender, &json!({ "type": "welcome" })).await.is_err() {
        return;
    }
    debug!("viewer connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "viewer lagged behind fan-out"),
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = viewer_reply(&state.control, text.as_str()).await;
                    if send_json(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "viewer socket error");
                    break;
                }
            },
        }
    }
    debug!("viewer disconnected");
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<T: CommandTransport>(state: AppState<T>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "control plane listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ============================================================================
// Tests
// ============================================================================
