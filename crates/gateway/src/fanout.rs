//! Realtime fan-out to connected viewers, backed by a tokio broadcast
//! channel. Publishing never fails; with no subscribers the event is dropped.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::model::{Action, ClockTime, DeviceStatus, DeviceType, SensorKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FanoutEvent {
    #[serde(rename_all = "camelCase")]
    Telemetry {
        device_id: String,
        /// Decoded reading, or the raw payload when it could not be decoded.
        data: Value,
        #[serde(with = "time::serde::rfc3339")]
        created_at: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    ScheduleExecuted {
        schedule_id: i64,
        device_type: DeviceType,
        action: Action,
        time: ClockTime,
        description: Option<String>,
        #[serde(with = "time::serde::rfc3339")]
        executed_at: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    SensorControl {
        device_type: DeviceType,
        action: Action,
        sensor_type: SensorKind,
        sensor_value: f64,
        min_threshold: f64,
        max_threshold: f64,
        reason: String,
        #[serde(with = "time::serde::rfc3339")]
        executed_at: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    DeviceStatus {
        device_type: DeviceType,
        status: DeviceStatus,
        /// `echo` for device reports, `manual` for operator commands.
        source: &'static str,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

#[derive(Clone)]
pub struct Fanout {
    sender: broadcast::Sender<FanoutEvent>,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: FanoutEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let fanout = Fanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        let event = FanoutEvent::DeviceStatus {
            device_type: DeviceType::Fan,
            status: DeviceStatus::On,
            source: "echo",
            timestamp: datetime!(2026-10-19 08:00 UTC),
        };
        fanout.publish(event.clone());
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        Fanout::new(1).publish(FanoutEvent::Telemetry {
            device_id: "farm01".into(),
            data: Value::Null,
            created_at: datetime!(2026-10-19 08:00 UTC),
        });
    }

    #[test]
    fn sensor_control_wire_shape() {
        let event = FanoutEvent::SensorControl {
            device_type: DeviceType::Fan,
            action: Action::On,
            sensor_type: SensorKind::Temperature,
            sensor_value: 37.0,
            min_threshold: 28.0,
            max_threshold: 35.0,
            reason: "temperature=37 > 35".into(),
            executed_at: datetime!(2026-10-19 08:00 UTC),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "sensorControl");
        assert_eq!(v["deviceType"], "fan");
        assert_eq!(v["sensorType"], "temperature");
        assert_eq!(v["sensorValue"], 37.0);
        assert_eq!(v["executedAt"], "2026-10-19T08:00:00Z");
    }

    #[test]
    fn schedule_executed_wire_shape() {
        let event = FanoutEvent::ScheduleExecuted {
            schedule_id: 3,
            device_type: DeviceType::Lamp,
            action: Action::Off,
            time: ClockTime::new(6, 0).unwrap(),
            description: None,
            executed_at: datetime!(2026-10-19 06:00 +7),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "scheduleExecuted");
        assert_eq!(v["time"], "06:00");
        assert_eq!(v["action"], "off");
    }
}
