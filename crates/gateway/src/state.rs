use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::warn;

use crate::fanout::{Fanout, FanoutEvent};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub last_telemetry: Option<TelemetrySnapshot>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub farm_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub data: Value,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Schedule,
    Sensor,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub last_telemetry: Option<TelemetrySnapshot>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            last_telemetry: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a decoded telemetry frame from a farm board.
    pub fn record_telemetry(&mut self, farm_id: &str, data: Value) {
        let detail = format!("{farm_id}: {data}");
        self.last_telemetry = Some(TelemetrySnapshot {
            farm_id: farm_id.to_string(),
            received_at: OffsetDateTime::now_utc(),
            data,
        });
        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Record a control-side fan-out event. Telemetry is recorded by the
    /// ingest path itself and ignored here.
    pub fn record_fanout(&mut self, event: &FanoutEvent) {
        match event {
            FanoutEvent::Telemetry { .. } => {}
            FanoutEvent::ScheduleExecuted {
                schedule_id,
                device_type,
                action,
                time,
                ..
            } => self.push_event(
                EventKind::Schedule,
                format!("schedule #{schedule_id} ({time}) set {device_type} {action}"),
            ),
            FanoutEvent::SensorControl {
                device_type,
                action,
                reason,
                ..
            } => self.push_event(
                EventKind::Sensor,
                format!("{device_type} {action}: {reason}"),
            ),
            FanoutEvent::DeviceStatus {
                device_type,
                status,
                source,
                ..
            } => self.push_event(
                EventKind::Command,
                format!("{device_type} is {status} ({source})"),
            ),
        }
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            last_telemetry: self.last_telemetry.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror control-side fan-out events into the status log until the
/// channel closes.
pub async fn record_fanout_events(fanout: Fanout, shared: SharedState) {
    let mut rx = fanout.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => shared.write().await.record_fanout(&event),
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "status recorder lagged behind fan-out");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
