//! In-memory live state: the latest reading per sensor kind and the
//! last-known on/off status per device type.

use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::model::{DeviceStatus, DeviceType, SensorKind};

/// Readings older than this are never acted upon.
pub const STALE_AFTER: Duration = Duration::seconds(120);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveReading {
    pub value: f64,
    pub unit: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

impl LiveReading {
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.last_update
    }

    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.age(now) > STALE_AFTER
    }
}

#[derive(Default)]
pub struct LiveState {
    readings: RwLock<HashMap<SensorKind, LiveReading>>,
    pump: Mutex<DeviceStatus>,
    fan: Mutex<DeviceStatus>,
    lamp: Mutex<DeviceStatus>,
    global: Mutex<DeviceStatus>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn record(&self, kind: SensorKind, value: f64, at: OffsetDateTime) {
        let reading = LiveReading {
            value,
            unit: kind.unit(),
            last_update: at,
        };
        self.readings.write().await.insert(kind, reading);
    }

    pub async fn reading(&self, kind: SensorKind) -> Option<LiveReading> {
        self.readings.read().await.get(&kind).cloned()
    }

    pub async fn readings(&self) -> HashMap<SensorKind, LiveReading> {
        self.readings.read().await.clone()
    }

    // ----------------------------
    // Device status
    // ----------------------------

    fn slot(&self, device: DeviceType) -> &Mutex<DeviceStatus> {
        match device {
            DeviceType::Pump => &self.pump,
            DeviceType::Fan => &self.fan,
            DeviceType::Lamp => &self.lamp,
            DeviceType::Global => &self.global,
        }
    }

    /// Exclusive access to a device's status. Holders check, publish and
    /// write back before releasing, so two triggers never interleave.
    pub async fn lock_status(&self, device: DeviceType) -> MutexGuard<'_, DeviceStatus> {
        self.slot(device).lock().await
    }

    pub async fn status(&self, device: DeviceType) -> DeviceStatus {
        *self.lock_status(device).await
    }

    pub async fn set_status(&self, device: DeviceType, status: DeviceStatus) {
        *self.lock_status(device).await = status;
    }

    pub async fn statuses(&self) -> HashMap<DeviceType, DeviceStatus> {
        let mut out = HashMap::new();
        for device in DeviceType::ACTUATORS {
            out.insert(device, self.status(device).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_overwrites_and_sets_unit() {
        let live = LiveState::new();
        let t0 = OffsetDateTime::now_utc();
        live.record(SensorKind::Temperature, 30.5, t0).await;
        live.record(SensorKind::Temperature, 31.0, t0).await;

        let r = live.reading(SensorKind::Temperature).await.unwrap();
        assert_eq!(r.value, 31.0);
        assert_eq!(r.unit, "°C");
        assert!(live.reading(SensorKind::Light).await.is_none());
    }

    #[test]
    fn staleness_boundary() {
        let now = OffsetDateTime::now_utc();
        let at_limit = LiveReading {
            value: 1.0,
            unit: "%",
            last_update: now - Duration::seconds(120),
        };
        assert!(!at_limit.is_stale(now));
        let older = LiveReading {
            last_update: now - Duration::seconds(121),
            ..at_limit
        };
        assert!(older.is_stale(now));
    }

    #[tokio::test]
    async fn status_starts_unknown() {
        let live = LiveState::new();
        assert_eq!(live.status(DeviceType::Pump).await, DeviceStatus::Unknown);
        live.set_status(DeviceType::Pump, DeviceStatus::On).await;
        let all = live.statuses().await;
        assert_eq!(all[&DeviceType::Pump], DeviceStatus::On);
        assert_eq!(all[&DeviceType::Fan], DeviceStatus::Unknown);
        assert!(!all.contains_key(&DeviceType::Global));
    }
}
