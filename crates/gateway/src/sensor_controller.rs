//! Sensor automation: one cancellable polling loop per device type in
//! `sensor` mode. Every tick reloads the device's thresholds from the store,
//! reads the live sensor value and issues at most one corrective command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::fanout::{Fanout, FanoutEvent};
use crate::live::LiveState;
use crate::model::{Action, DeviceModeConfig, DeviceType, Mode, SensorKind};
use crate::publisher::{CommandPublisher, CommandTransport, Delivery};
use crate::store::DeviceModeStore;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Hysteresis decision for one reading. Temperature drives a cooling
/// actuator (too hot turns it on); every other kind drives a supplying one
/// (too low turns it on). Returns the action and a human-readable reason.
pub fn decide(kind: SensorKind, value: f64, min: f64, max: f64) -> Option<(Action, String)> {
    let (below, above) = match kind {
        SensorKind::Temperature => (Action::Off, Action::On),
        _ => (Action::On, Action::Off),
    };
    if value < min {
        Some((below, format!("{kind}={value} < {min}")))
    } else if value > max {
        Some((above, format!("{kind}={value} > {max}")))
    } else {
        None
    }
}

/// What a single evaluation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CheckOutcome {
    /// The device left sensor mode; its monitor was stopped.
    Deactivated { mode: Mode },
    NoData { sensor: SensorKind },
    Stale { sensor: SensorKind, age_secs: i64 },
    WithinRange { sensor: SensorKind, value: f64 },
    /// The decided action matched the known device status.
    Unchanged { action: Action },
    Commanded { action: Action, reason: String },
    /// Store or broker failure; the cycle was skipped.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RestartOutcome {
    Started { interval_secs: u32, first_check: CheckOutcome },
    NotInSensorMode { mode: Mode },
    Inactive,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Monitor {
    generation: u64,
    // Dropping the sender cancels the loop at its next wait.
    _cancel: oneshot::Sender<()>,
}

struct EvalLocks {
    pump: Mutex<()>,
    fan: Mutex<()>,
    lamp: Mutex<()>,
    global: Mutex<()>,
}

impl EvalLocks {
    fn new() -> Self {
        Self {
            pump: Mutex::new(()),
            fan: Mutex::new(()),
            lamp: Mutex::new(()),
            global: Mutex::new(()),
        }
    }

    fn get(&self, device: DeviceType) -> &Mutex<()> {
        match device {
            DeviceType::Pump => &self.pump,
            DeviceType::Fan => &self.fan,
            DeviceType::Lamp => &self.lamp,
            DeviceType::Global => &self.global,
        }
    }
}

struct Inner<S, T> {
    store: Arc<S>,
    publisher: Arc<CommandPublisher<T>>,
    live: Arc<LiveState>,
    fanout: Fanout,
    monitors: StdMutex<HashMap<DeviceType, Monitor>>,
    eval_locks: EvalLocks,
    next_generation: AtomicU64,
}

pub struct SensorController<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for SensorController<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DeviceModeStore, T: CommandTransport> SensorController<S, T> {
    pub fn new(
        store: Arc<S>,
        publisher: Arc<CommandPublisher<T>>,
        live: Arc<LiveState>,
        fanout: Fanout,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                publisher,
                live,
                fanout,
                monitors: StdMutex::new(HashMap::new()),
                eval_locks: EvalLocks::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Begin monitoring every active device currently in sensor mode.
    /// Returns how many monitors were started.
    pub async fn start(&self) -> Result<usize> {
        let configs = self
            .inner
            .store
            .list_by_mode(Mode::Sensor)
            .await
            .context("loading sensor-mode devices failed")?;

        let mut started = 0;
        for cfg in configs.iter().filter(|c| c.is_active && c.device_type.is_actuator()) {
            let interval = cfg.effective_sensor_config().check_interval;
            self.start_sensor_check(cfg.device_type, interval).await;
            started += 1;
        }
        info!(started, "sensor controller started");
        Ok(started)
    }

    /// Stop every monitor.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.lock_monitors().drain().map(|(d, _)| d).collect();
        for device in drained {
            debug!(device = %device, "sensor monitor cancelled");
        }
    }

    /// (Re)start the polling loop for `device`. Any existing loop is
    /// cancelled first. One evaluation runs before this returns.
    pub async fn start_sensor_check(&self, device: DeviceType, check_interval: u32) -> CheckOutcome {
        let period = Duration::from_secs(u64::from(check_interval.max(1)));
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let replaced = self.lock_monitors().insert(
            device,
            Monitor {
                generation,
                _cancel: cancel_tx,
            },
        );
        if replaced.is_some() {
            debug!(device = %device, "previous sensor monitor cancelled");
        }
        info!(device = %device, interval_s = check_interval, "sensor monitor started");

        let ctl = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {}
                }
                // Once started, an evaluation runs to completion.
                ctl.evaluate(device, generation).await;
            }
            debug!(device = %device, generation, "sensor monitor loop exited");
        });

        self.evaluate(device, generation).await
    }

    /// Cancel the polling loop for `device`. No-op if none is running.
    pub fn stop_sensor_check(&self, device: DeviceType) -> bool {
        let stopped = self.lock_monitors().remove(&device).is_some();
        if stopped {
            info!(device = %device, "sensor monitor stopped");
        }
        stopped
    }

    /// Stop, reload the stored config and start again if the device is
    /// (still) an active sensor-mode device.
    pub async fn restart_sensor_check(&self, device: DeviceType) -> Result<RestartOutcome> {
        self.stop_sensor_check(device);
        let cfg = self
            .inner
            .store
            .get_mode(device)
            .await
            .with_context(|| format!("loading mode for {device} failed"))?;

        if cfg.mode != Mode::Sensor || !device.is_actuator() {
            info!(device = %device, mode = %cfg.mode, "not in sensor mode; monitor left stopped");
            return Ok(RestartOutcome::NotInSensorMode { mode: cfg.mode });
        }
        if !cfg.is_active {
            info!(device = %device, "device inactive; monitor left stopped");
            return Ok(RestartOutcome::Inactive);
        }
        let interval_secs = cfg.effective_sensor_config().check_interval;
        let first_check = self.start_sensor_check(device, interval_secs).await;
        Ok(RestartOutcome::Started {
            interval_secs,
            first_check,
        })
    }

    /// Evaluate `device` once, outside its timer.
    pub async fn check_and_control(&self, device: DeviceType) -> CheckOutcome {
        let generation = self.current_generation(device).unwrap_or(0);
        self.evaluate(device, generation).await
    }

    /// Device types with a running monitor.
    pub fn monitored(&self) -> Vec<DeviceType> {
        let mut devices: Vec<_> = self.lock_monitors().keys().copied().collect();
        devices.sort();
        devices
    }

    // ----------------------------
    // Internals
    // ----------------------------

    fn lock_monitors(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceType, Monitor>> {
        // A poisoned map is still structurally valid.
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_generation(&self, device: DeviceType) -> Option<u64> {
        self.lock_monitors().get(&device).map(|m| m.generation)
    }

    /// Remove the monitor only if it is still the one that observed the
    /// mode change; a newer restart must survive a stale tick.
    fn stop_generation(&self, device: DeviceType, generation: u64) {
        let mut monitors = self.lock_monitors();
        if monitors.get(&device).map(|m| m.generation) == Some(generation) {
            monitors.remove(&device);
            info!(device = %device, "left sensor mode; monitor stopped");
        }
    }

    async fn evaluate(&self, device: DeviceType, generation: u64) -> CheckOutcome {
        let _serial = self.inner.eval_locks.get(device).lock().await;

        let cfg = match self.inner.store.get_mode(device).await {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(device = %device, error = %format!("{e:#}"), "sensor check skipped: config load failed");
                return CheckOutcome::Failed;
            }
        };

        if cfg.mode != Mode::Sensor {
            self.stop_generation(device, generation);
            return CheckOutcome::Deactivated { mode: cfg.mode };
        }

        self.act_on(&cfg, OffsetDateTime::now_utc()).await
    }

    async fn act_on(&self, cfg: &DeviceModeConfig, now: OffsetDateTime) -> CheckOutcome {
        let device = cfg.device_type;
        let sc = cfg.effective_sensor_config();
        let sensor = sc.sensor_type;

        let Some(reading) = self.inner.live.reading(sensor).await else {
            debug!(device = %device, sensor = %sensor, "no reading yet; skipping");
            return CheckOutcome::NoData { sensor };
        };
        if reading.is_stale(now) {
            let age_secs = reading.age(now).whole_seconds();
            warn!(device = %device, sensor = %sensor, age_sec = age_secs, "reading stale; skipping");
            return CheckOutcome::Stale { sensor, age_secs };
        }

        let Some((action, reason)) = decide(sensor, reading.value, sc.min_threshold, sc.max_threshold)
        else {
            debug!(device = %device, sensor = %sensor, value = reading.value, "within thresholds");
            return CheckOutcome::WithinRange {
                sensor,
                value: reading.value,
            };
        };

        match self.inner.publisher.send_if_changed(device, action).await {
            Ok(Delivery::Suppressed) => {
                debug!(device = %device, action = %action, "already in requested state");
                CheckOutcome::Unchanged { action }
            }
            Ok(Delivery::Published) => {
                info!(device = %device, action = %action, reason = %reason, "sensor control");
                self.inner.fanout.publish(FanoutEvent::SensorControl {
                    device_type: device,
                    action,
                    sensor_type: sensor,
                    sensor_value: reading.value,
                    min_threshold: sc.min_threshold,
                    max_threshold: sc.max_threshold,
                    reason: reason.clone(),
                    executed_at: now,
                });
                CheckOutcome::Commanded { action, reason }
            }
            Err(_) => CheckOutcome::Failed,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
