//! Inbound message handling: telemetry frames feed the live cache, the
//! telemetry log and sensor history; status echoes update device status.

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::db::{Db, SensorSample, TelemetryRecord};
use crate::fanout::{Fanout, FanoutEvent};
use crate::live::LiveState;
use crate::model::{DeviceStatus, DeviceType, SensorKind};
use crate::mqtt::{capture_wildcard, parse_status, parse_telemetry, FarmReading, Subscriptions};
use crate::state::SharedState;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Telemetry { farm_id: String, decoded: bool },
    Status { device: DeviceType, status: DeviceStatus },
    Ignored,
}

pub struct Ingest {
    db: Db,
    live: Arc<LiveState>,
    fanout: Fanout,
    shared: SharedState,
    subs: Subscriptions,
}

impl Ingest {
    pub fn new(
        db: Db,
        live: Arc<LiveState>,
        fanout: Fanout,
        shared: SharedState,
        subs: Subscriptions,
    ) -> Self {
        Self {
            db,
            live,
            fanout,
            shared,
            subs,
        }
    }

    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) -> Handled {
        let now = OffsetDateTime::now_utc();
        if let Some(farm_id) = capture_wildcard(&self.subs.telemetry, topic) {
            let decoded = self.on_telemetry(farm_id, topic, payload, now).await;
            return Handled::Telemetry {
                farm_id: farm_id.to_string(),
                decoded,
            };
        }
        if let Some(name) = capture_wildcard(&self.subs.status, topic) {
            return self.on_status(name, payload, now).await;
        }
        debug!(topic, "unhandled topic");
        Handled::Ignored
    }

    async fn on_telemetry(&self, farm_id: &str, topic: &str, payload: &[u8], now: OffsetDateTime) -> bool {
        let raw = String::from_utf8_lossy(payload).into_owned();
        match parse_telemetry(payload) {
            Ok(reading) => {
                self.accept_reading(farm_id, topic, raw, &reading, now).await;
                true
            }
            Err(reason) => {
                warn!(farm = %farm_id, %reason, "telemetry shape not recognised; keeping raw payload");
                let record = TelemetryRecord {
                    ts: now,
                    device_id: farm_id.to_string(),
                    topic: topic.to_string(),
                    temperature: None,
                    humidity: None,
                    soil_moisture: None,
                    ctr_pump: None,
                    ctr_lamp: None,
                    ctr_fan: None,
                    raw: raw.clone(),
                };
                if let Err(e) = self.db.insert_telemetry(&record).await {
                    warn!(error = %format!("{e:#}"), "db: insert_telemetry failed");
                }
                self.fanout.publish(FanoutEvent::Telemetry {
                    device_id: farm_id.to_string(),
                    data: json!({ "raw": raw }),
                    created_at: now,
                });
                self.shared
                    .write()
                    .await
                    .record_error(format!("bad telemetry from {farm_id}: {reason}"));
                false
            }
        }
    }

    async fn accept_reading(
        &self,
        farm_id: &str,
        topic: &str,
        raw: String,
        r: &FarmReading,
        now: OffsetDateTime,
    ) {
        self.live.record(SensorKind::Temperature, r.temperature, now).await;
        self.live.record(SensorKind::Humidity, r.humidity, now).await;
        self.live.record(SensorKind::SoilMoisture, r.soil_moisture, now).await;
        if let Some(light) = r.light {
            self.live.record(SensorKind::Light, light, now).await;
        }
        debug!(
            farm = %farm_id,
            temperature = r.temperature,
            humidity = r.humidity,
            soil = r.soil_moisture,
            "telemetry"
        );

        let record = TelemetryRecord {
            ts: now,
            device_id: farm_id.to_string(),
            topic: topic.to_string(),
            temperature: Some(r.temperature),
            humidity: Some(r.humidity),
            soil_moisture: Some(r.soil_moisture),
            ctr_pump: r.pump,
            ctr_lamp: r.lamp,
            ctr_fan: r.fan,
            raw,
        };
        if let Err(e) = self.db.insert_telemetry(&record).await {
            warn!(error = %format!("{e:#}"), "db: insert_telemetry failed");
        }
        let sample = SensorSample {
            ts: now,
            temperature: Some(r.temperature),
            humidity: Some(r.humidity),
            soil_moisture: Some(r.soil_moisture),
            light: r.light,
        };
        if let Err(e) = self.db.insert_sensor_sample(&sample).await {
            warn!(error = %format!("{e:#}"), "db: insert_sensor_sample failed");
        }

        let data = r.to_json();
        self.fanout.publish(FanoutEvent::Telemetry {
            device_id: farm_id.to_string(),
            data: data.clone(),
            created_at: now,
        });
        self.shared.write().await.record_telemetry(farm_id, data);
    }

    async fn on_status(&self, name: &str, payload: &[u8], now: OffsetDateTime) -> Handled {
        let device = match name.parse::<DeviceType>() {
            Ok(d) if d.is_actuator() => d,
            _ => {
                warn!(device = %name, "status echo for unknown device");
                return Handled::Ignored;
            }
        };
        let status = match parse_status(payload) {
            Ok(s) => s,
            Err(msg) => {
                warn!(device = %device, %msg, "bad status echo");
                self.shared.write().await.record_error(format!("{device}: {msg}"));
                return Handled::Ignored;
            }
        };

        self.live.set_status(device, status).await;
        info!(device = %device, status = %status, "device status echo");
        self.fanout.publish(FanoutEvent::DeviceStatus {
            device_type: device,
            status,
            source: "echo",
            timestamp: now,
        });
        Handled::Status { device, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HistoryRange;
    use crate::state::SystemState;

    struct Harness {
        db: Db,
        live: Arc<LiveState>,
        fanout: Fanout,
        shared: SharedState,
        ingest: Ingest,
    }

    async fn harness() -> Harness {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let live = Arc::new(LiveState::new());
        let fanout = Fanout::new(16);
        let shared = SystemState::shared();
        let subs = Subscriptions {
            telemetry: "serverfm/devices/+/telemetry".into(),
            status: "device/+/status".into(),
        };
        let ingest = Ingest::new(db.clone(), live.clone(), fanout.clone(), shared.clone(), subs);
        Harness {
            db,
            live,
            fanout,
            shared,
            ingest,
        }
    }

    #[tokio::test]
    async fn decoded_telemetry_updates_everything() {
        let h = harness().await;
        let mut events = h.fanout.subscribe();

        let handled = h
            .ingest
            .handle_publish("serverfm/devices/farm01/telemetry", br#"{"data":[31.5,62,44,1,0,1]}"#)
            .await;
        assert_eq!(
            handled,
            Handled::Telemetry {
                farm_id: "farm01".into(),
                decoded: true
            }
        );

        let temp = h.live.reading(SensorKind::Temperature).await.unwrap();
        assert_eq!(temp.value, 31.5);
        assert_eq!(h.live.reading(SensorKind::SoilMoisture).await.unwrap().value, 44.0);
        assert!(h.live.reading(SensorKind::Light).await.is_none());

        // Echo bits are logged, not treated as device status.
        assert_eq!(h.live.status(DeviceType::Pump).await, DeviceStatus::Unknown);

        let rows = h.db.recent_telemetry(Some("farm01"), 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ctr_pump, Some(1));
        let history = h
            .db
            .sensor_history(HistoryRange::OneHour, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);

        match events.recv().await.unwrap() {
            FanoutEvent::Telemetry { device_id, data, .. } => {
                assert_eq!(device_id, "farm01");
                assert_eq!(data["soilMoisture"], 44.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(h.shared.read().await.last_telemetry.is_some());
    }

    #[tokio::test]
    async fn malformed_telemetry_kept_raw() {
        let h = harness().await;
        let handled = h
            .ingest
            .handle_publish("serverfm/devices/farm01/telemetry", b"temp=31")
            .await;
        assert_eq!(
            handled,
            Handled::Telemetry {
                farm_id: "farm01".into(),
                decoded: false
            }
        );
        assert!(h.live.readings().await.is_empty());

        let rows = h.db.recent_telemetry(None, 10, 0).await.unwrap();
        assert_eq!(rows[0].raw, "temp=31");
        assert_eq!(rows[0].temperature, None);
        assert!(h
            .db
            .sensor_history(HistoryRange::OneHour, OffsetDateTime::now_utc())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn status_echo_updates_device_status() {
        let h = harness().await;
        let mut events = h.fanout.subscribe();
        let handled = h.ingest.handle_publish("device/fan/status", br#"{"status":"on"}"#).await;
        assert_eq!(
            handled,
            Handled::Status {
                device: DeviceType::Fan,
                status: DeviceStatus::On
            }
        );
        assert_eq!(h.live.status(DeviceType::Fan).await, DeviceStatus::On);
        assert!(matches!(
            events.recv().await.unwrap(),
            FanoutEvent::DeviceStatus { device_type: DeviceType::Fan, .. }
        ));
    }

    #[tokio::test]
    async fn status_echo_for_unknown_device_ignored() {
        let h = harness().await;
        assert_eq!(h.ingest.handle_publish("device/heater/status", b"1").await, Handled::Ignored);
        assert_eq!(h.ingest.handle_publish("device/global/status", b"1").await, Handled::Ignored);
        assert_eq!(h.ingest.handle_publish("device/pump/status", b"maybe").await, Handled::Ignored);
        assert_eq!(h.live.status(DeviceType::Pump).await, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn other_topics_ignored() {
        let h = harness().await;
        assert_eq!(
            h.ingest.handle_publish("serverfm/devices/farm01/control", br#"{"pump":1}"#).await,
            Handled::Ignored
        );
    }
}
