//! Operator-facing operations. Every write is followed by a reconciliation
//! step so the running monitors always match what is stored.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::fanout::{Fanout, FanoutEvent};
use crate::model::{
    Action, ClockTime, DeviceModeConfig, DeviceType, Mode, ModePatch, NewSchedule, Repeat,
    RepeatKind, ScheduleEntry, ScheduleFilter, SensorConfigPatch, ValidationError,
};
use crate::publisher::{CommandPublisher, CommandTransport};
use crate::scheduler::{next_run, runs_on_day, Execution, Scheduler};
use crate::sensor_controller::{CheckOutcome, RestartOutcome, SensorController};
use crate::store::{DeviceModeStore, ScheduleStore};

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeUpdate {
    pub config: DeviceModeConfig,
    /// Whether a sensor monitor is running for the device afterwards.
    pub monitoring: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub device_type: DeviceType,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: Mode,
    pub succeeded: Vec<DeviceType>,
    pub failed: Vec<SyncFailure>,
}

/// Body of a schedule create. Names are parsed here so that a bad value is
/// a validation error rather than a decode failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub device_type: String,
    pub action: String,
    pub time: String,
    #[serde(default = "Repeat::daily")]
    pub repeat: Repeat,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub device_type: Option<String>,
    pub action: Option<String>,
    pub time: Option<String>,
    pub repeat: Option<Repeat>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleList {
    pub schedules: Vec<ScheduleEntry>,
    pub stats: ScheduleStats,
}

fn schedule_target(name: &str) -> Result<DeviceType, ValidationError> {
    let device = DeviceType::from_str(name)?;
    if !device.is_actuator() {
        return Err(ValidationError::GlobalSchedule);
    }
    Ok(device)
}

/// Decode a control command body such as `{"pump":1}`.
pub fn parse_command(cmd: &Value) -> Result<(DeviceType, Action), ValidationError> {
    let bad = || ValidationError::Unknown {
        kind: "command",
        value: cmd.to_string(),
    };
    let map = cmd.as_object().filter(|m| m.len() == 1).ok_or_else(bad)?;
    let (key, value) = map.iter().next().ok_or_else(bad)?;
    let device = DeviceType::from_str(key)?;
    let action = value.as_i64().and_then(Action::from_bit).ok_or_else(bad)?;
    Ok((device, action))
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

pub struct ControlPlane<S, T> {
    store: Arc<S>,
    sensors: SensorController<S, T>,
    scheduler: Scheduler<S, T>,
    publisher: Arc<CommandPublisher<T>>,
    fanout: Fanout,
}

impl<S, T> ControlPlane<S, T>
where
    S: DeviceModeStore + ScheduleStore,
    T: CommandTransport,
{
    pub fn new(
        store: Arc<S>,
        sensors: SensorController<S, T>,
        scheduler: Scheduler<S, T>,
        publisher: Arc<CommandPublisher<T>>,
        fanout: Fanout,
    ) -> Self {
        Self {
            store,
            sensors,
            scheduler,
            publisher,
            fanout,
        }
    }

    pub fn sensors(&self) -> &SensorController<S, T> {
        &self.sensors
    }

    pub fn scheduler(&self) -> &Scheduler<S, T> {
        &self.scheduler
    }

    /// Start sensor monitors for stored sensor-mode devices and the minute
    /// loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.sensors.start().await?;
        self.scheduler.start();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.sensors.shutdown();
    }

    // ----------------------------
    // Device modes
    // ----------------------------

    pub async fn device_mode(&self, device: DeviceType) -> GatewayResult<DeviceModeConfig> {
        Ok(self.store.get_mode(device).await?)
    }

    pub async fn device_modes(&self) -> GatewayResult<Vec<DeviceModeConfig>> {
        let mut modes = Vec::new();
        for device in DeviceType::ACTUATORS.into_iter().chain([DeviceType::Global]) {
            modes.push(self.store.get_mode(device).await?);
        }
        Ok(modes)
    }

    pub async fn switch_mode(&self, device: DeviceType, mode: Mode) -> GatewayResult<ModeUpdate> {
        info!(device = %device, mode = %mode, "switching mode");
        self.update_device_mode(device, ModePatch::mode(mode)).await
    }

    /// Apply a partial update. Monitors are reconciled when the mode or the
    /// active flag was part of it.
    pub async fn update_device_mode(
        &self,
        device: DeviceType,
        patch: ModePatch,
    ) -> GatewayResult<ModeUpdate> {
        let config = self
            .store
            .upsert_mode(device, &patch, OffsetDateTime::now_utc())
            .await?;
        if patch.mode.is_some() || patch.is_active.is_some() {
            self.reconcile(&config).await?;
        }
        let monitoring = self.sensors.monitored().contains(&device);
        Ok(ModeUpdate { config, monitoring })
    }

    /// Thresholds take effect on the next tick; a new interval only on the
    /// next restart.
    pub async fn update_sensor_config(
        &self,
        device: DeviceType,
        patch: SensorConfigPatch,
    ) -> GatewayResult<DeviceModeConfig> {
        let patch = ModePatch {
            sensor_config: Some(patch),
            ..ModePatch::default()
        };
        Ok(self
            .store
            .upsert_mode(device, &patch, OffsetDateTime::now_utc())
            .await?)
    }

    /// Put every actuator in `mode`, one at a time. A failing device does
    /// not stop the others.
    pub async fn sync_all(&self, mode: Mode) -> GatewayResult<SyncReport> {
        let mut report = SyncReport {
            mode,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for device in DeviceType::ACTUATORS {
            match self.switch_mode(device, mode).await {
                Ok(_) => report.succeeded.push(device),
                Err(e) => {
                    warn!(device = %device, error = %e, "sync: device failed");
                    report.failed.push(SyncFailure {
                        device_type: device,
                        error: e.to_string(),
                    });
                }
            }
        }

        let global = ModePatch {
            mode: Some(mode),
            sync_mode: Some(true),
            ..ModePatch::default()
        };
        match self
            .store
            .upsert_mode(DeviceType::Global, &global, OffsetDateTime::now_utc())
            .await
        {
            Ok(_) => report.succeeded.push(DeviceType::Global),
            Err(e) => report.failed.push(SyncFailure {
                device_type: DeviceType::Global,
                error: format!("{e:#}"),
            }),
        }
        info!(
            mode = %mode,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "sync all"
        );
        Ok(report)
    }

    pub async fn set_sync_mode(&self, enabled: bool) -> GatewayResult<DeviceModeConfig> {
        let patch = ModePatch {
            sync_mode: Some(enabled),
            ..ModePatch::default()
        };
        Ok(self
            .store
            .upsert_mode(DeviceType::Global, &patch, OffsetDateTime::now_utc())
            .await?)
    }

    pub async fn restart_sensor(&self, device: DeviceType) -> GatewayResult<RestartOutcome> {
        Ok(self.sensors.restart_sensor_check(device).await?)
    }

    /// One evaluation right now, outside the device's timer.
    pub async fn check_sensor(&self, device: DeviceType) -> GatewayResult<CheckOutcome> {
        if !device.is_actuator() {
            return Err(ValidationError::Unknown {
                kind: "actuator",
                value: device.to_string(),
            }
            .into());
        }
        Ok(self.sensors.check_and_control(device).await)
    }

    async fn reconcile(&self, cfg: &DeviceModeConfig) -> GatewayResult<()> {
        let device = cfg.device_type;
        if !device.is_actuator() {
            return Ok(());
        }
        if cfg.mode == Mode::Sensor && cfg.is_active {
            self.sensors.restart_sensor_check(device).await?;
        } else {
            self.sensors.stop_sensor_check(device);
        }
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> GatewayResult<ScheduleList> {
        let schedules = self.store.list_schedules(filter).await?;
        let active = schedules.iter().filter(|e| e.is_active).count();
        let stats = ScheduleStats {
            total: schedules.len(),
            active,
            inactive: schedules.len() - active,
        };
        Ok(ScheduleList { schedules, stats })
    }

    pub async fn schedule(&self, id: i64) -> GatewayResult<ScheduleEntry> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| GatewayError::not_found("schedule", id))
    }

    pub async fn create_schedule(&self, req: ScheduleRequest) -> GatewayResult<ScheduleEntry> {
        let device_type = schedule_target(&req.device_type)?;
        let action = Action::from_str(&req.action)?;
        let time = ClockTime::from_str(&req.time)?;
        req.repeat.validate()?;

        let next_run = next_run(time, &req.repeat, None, self.scheduler.local_now());
        let entry = self
            .store
            .insert_schedule(&NewSchedule {
                device_type,
                action,
                time,
                repeat: req.repeat,
                is_active: req.is_active,
                description: req.description,
                next_run,
            })
            .await?;
        info!(id = entry.id, device = %device_type, action = %action, time = %time, "schedule created");
        Ok(entry)
    }

    pub async fn update_schedule(&self, id: i64, upd: ScheduleUpdate) -> GatewayResult<ScheduleEntry> {
        let mut entry = self.schedule(id).await?;

        if let Some(name) = &upd.device_type {
            entry.device_type = schedule_target(name)?;
        }
        if let Some(action) = &upd.action {
            entry.action = Action::from_str(action)?;
        }
        let retimed = upd.time.is_some() || upd.repeat.is_some();
        if let Some(time) = &upd.time {
            entry.time = ClockTime::from_str(time)?;
        }
        if let Some(repeat) = upd.repeat {
            repeat.validate()?;
            entry.repeat = repeat;
        }
        if let Some(description) = upd.description {
            entry.description = Some(description);
        }
        if let Some(active) = upd.is_active {
            self.set_active(&mut entry, active);
        }
        if retimed {
            entry.next_run = next_run(entry.time, &entry.repeat, entry.last_run, self.scheduler.local_now());
        }

        self.store.save_schedule(&entry).await?;
        Ok(entry)
    }

    pub async fn toggle_schedule(&self, id: i64) -> GatewayResult<ScheduleEntry> {
        let mut entry = self.schedule(id).await?;
        let active = !entry.is_active;
        self.set_active(&mut entry, active);
        self.store.save_schedule(&entry).await?;
        info!(id, active, "schedule toggled");
        Ok(entry)
    }

    pub async fn delete_schedule(&self, id: i64) -> GatewayResult<()> {
        if !self.store.delete_schedule(id).await? {
            return Err(GatewayError::not_found("schedule", id));
        }
        info!(id, "schedule deleted");
        Ok(())
    }

    /// Active entries whose next run falls on today's local date.
    pub async fn runs_today(&self) -> GatewayResult<Vec<ScheduleEntry>> {
        let entries = self.store.list_schedules(&ScheduleFilter::default()).await?;
        Ok(runs_on_day(entries, self.scheduler.local_now()))
    }

    pub async fn test_run(&self, id: i64) -> GatewayResult<Execution> {
        self.scheduler.test_run(id).await
    }

    // Re-arming a spent `once` entry forgets its previous run.
    fn set_active(&self, entry: &mut ScheduleEntry, active: bool) {
        if active && !entry.is_active && entry.repeat.kind == RepeatKind::Once {
            entry.last_run = None;
        }
        entry.is_active = active;
        entry.next_run = if active {
            next_run(entry.time, &entry.repeat, entry.last_run, self.scheduler.local_now())
        } else {
            None
        };
    }

    // ----------------------------
    // Manual override
    // ----------------------------

    /// Publish immediately, whatever mode the device is in.
    pub async fn manual_command(&self, device: DeviceType, action: Action) -> GatewayResult<()> {
        if !device.is_actuator() {
            return Err(ValidationError::Unknown {
                kind: "actuator",
                value: device.to_string(),
            }
            .into());
        }
        self.publisher
            .send(device, action)
            .await
            .map_err(|e| GatewayError::Transport(format!("{e:#}")))?;
        self.fanout.publish(FanoutEvent::DeviceStatus {
            device_type: device,
            status: action.into(),
            source: "manual",
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
