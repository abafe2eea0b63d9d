use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ingest::Ingest;
use crate::model::DeviceStatus;
use crate::state::SharedState;

/// Pause after a connection error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Telemetry payload
// ---------------------------------------------------------------------------

/// Decoded `{ "data": [temp, humi, soil, pump?, lamp?, fan?, light?] }`.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmReading {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub pump: Option<i64>,
    pub lamp: Option<i64>,
    pub fan: Option<i64>,
    pub light: Option<f64>,
}

impl FarmReading {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "temperature": self.temperature,
            "humidity": self.humidity,
            "soilMoisture": self.soil_moisture,
            "light": self.light,
            "pump": self.pump,
            "lamp": self.lamp,
            "fan": self.fan,
        })
    }
}

/// Decode a telemetry payload. The error string says why the shape was
/// rejected; callers keep the raw payload in that case.
pub(crate) fn parse_telemetry(payload: &[u8]) -> Result<FarmReading, String> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| format!("not json: {e}"))?;
    let data = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or("missing 'data' array")?;
    if data.len() < 3 {
        return Err(format!("'data' has {} slot(s), need at least 3", data.len()));
    }

    let number = |i: usize| -> Result<f64, String> {
        data[i]
            .as_f64()
            .ok_or_else(|| format!("slot {i} is not a number"))
    };
    let echo = |i: usize| -> Result<Option<i64>, String> {
        match data.get(i) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| format!("slot {i} is not an integer")),
        }
    };

    Ok(FarmReading {
        temperature: number(0)?,
        humidity: number(1)?,
        soil_moisture: number(2)?,
        pump: echo(3)?,
        lamp: echo(4)?,
        fan: echo(5)?,
        light: match data.get(6) {
            None | Some(Value::Null) => None,
            Some(_) => Some(number(6)?),
        },
    })
}

// ---------------------------------------------------------------------------
// Status echo payload
// ---------------------------------------------------------------------------

fn status_word(s: &str) -> Option<DeviceStatus> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "1" => Some(DeviceStatus::On),
        "off" | "0" => Some(DeviceStatus::Off),
        _ => None,
    }
}

/// Accepts `{"status":"on"}`, `{"action":"off"}`, `1`/`0` and bare `on`/`off`.
pub(crate) fn parse_status(payload: &[u8]) -> Result<DeviceStatus, String> {
    let text = String::from_utf8_lossy(payload);
    let parsed = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map
            .get("status")
            .or_else(|| map.get("action"))
            .and_then(|v| match v {
                Value::String(s) => status_word(s),
                Value::Number(n) => n.as_i64().and_then(|b| status_word(&b.to_string())),
                Value::Bool(b) => Some(if *b { DeviceStatus::On } else { DeviceStatus::Off }),
                _ => None,
            }),
        Ok(Value::Number(n)) => n.as_i64().and_then(|b| status_word(&b.to_string())),
        Ok(Value::String(s)) => status_word(&s),
        _ => status_word(&text),
    };
    parsed.ok_or_else(|| format!("unknown status payload '{}'", text.trim()))
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Match `topic` against a filter with exactly one `+` wildcard and return
/// the segment it captured. `serverfm/devices/+/telemetry` against
/// `serverfm/devices/farm01/telemetry` yields `farm01`.
pub(crate) fn capture_wildcard<'a>(filter: &str, topic: &'a str) -> Option<&'a str> {
    let f: Vec<&str> = filter.split('/').collect();
    let t: Vec<&str> = topic.split('/').collect();
    if f.len() != t.len() {
        return None;
    }
    let mut captured = None;
    for (fs, ts) in f.iter().zip(t.iter()) {
        match *fs {
            "+" if !ts.is_empty() && captured.is_none() => captured = Some(*ts),
            "+" => return None,
            _ if fs == ts => {}
            _ => return None,
        }
    }
    captured
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Topic filters the gateway listens on.
#[derive(Debug, Clone)]
pub struct Subscriptions {
    pub telemetry: String,
    pub status: String,
}

/// Drive the broker connection forever. Subscriptions are re-issued on every
/// ConnAck; errors are logged and retried after a short pause.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subs: Subscriptions,
    ingest: Arc<Ingest>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                ingest.handle_publish(&p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                for filter in [&subs.telemetry, &subs.status] {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %filter, error = %e, "mqtt subscribe failed");
                    } else {
                        debug!(topic = %filter, "mqtt subscribed");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system(format!(
                    "mqtt connected; subscribed to {} and {}",
                    subs.telemetry, subs.status
                ));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error; reconnecting");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- capture_wildcard ----------------------------------------------------

    #[test]
    fn capture_farm_id() {
        assert_eq!(
            capture_wildcard("serverfm/devices/+/telemetry", "serverfm/devices/farm01/telemetry"),
            Some("farm01")
        );
    }

    #[test]
    fn capture_status_device() {
        assert_eq!(capture_wildcard("device/+/status", "device/pump/status"), Some("pump"));
    }

    #[test]
    fn capture_rejects_wrong_suffix() {
        assert_eq!(capture_wildcard("device/+/status", "device/pump/control"), None);
    }

    #[test]
    fn capture_rejects_segment_count_mismatch() {
        assert_eq!(capture_wildcard("device/+/status", "device/status"), None);
        assert_eq!(capture_wildcard("device/+/status", "device/a/b/status"), None);
        assert_eq!(capture_wildcard("device/+/status", ""), None);
    }

    #[test]
    fn capture_rejects_empty_segment() {
        assert_eq!(capture_wildcard("device/+/status", "device//status"), None);
    }

    // -- parse_telemetry -----------------------------------------------------

    #[test]
    fn telemetry_full_frame() {
        let r = parse_telemetry(br#"{"data":[31.5,62,44,1,0,1]}"#).unwrap();
        assert_eq!(r.temperature, 31.5);
        assert_eq!(r.humidity, 62.0);
        assert_eq!(r.soil_moisture, 44.0);
        assert_eq!((r.pump, r.lamp, r.fan), (Some(1), Some(0), Some(1)));
        assert_eq!(r.light, None);
    }

    #[test]
    fn telemetry_sensor_slots_only() {
        let r = parse_telemetry(br#"{"data":[20,50,40]}"#).unwrap();
        assert_eq!(r.pump, None);
    }

    #[test]
    fn telemetry_with_light_slot() {
        let r = parse_telemetry(br#"{"data":[20,50,40,0,0,0,12.5]}"#).unwrap();
        assert_eq!(r.light, Some(12.5));
    }

    #[test]
    fn telemetry_rejects_bad_shapes() {
        assert!(parse_telemetry(b"hello").is_err());
        assert!(parse_telemetry(br#"{"temp":20}"#).is_err());
        assert!(parse_telemetry(br#"{"data":[20,50]}"#).is_err());
        assert!(parse_telemetry(br#"{"data":["20",50,40]}"#).is_err());
        assert!(parse_telemetry(br#"{"data":[20,50,40,"on"]}"#).is_err());
    }

    #[test]
    fn telemetry_extra_fields_ignored() {
        assert!(parse_telemetry(br#"{"data":[20,50,40],"rssi":-60}"#).is_ok());
    }

    // -- parse_status --------------------------------------------------------

    #[test]
    fn status_object_forms() {
        assert_eq!(parse_status(br#"{"status":"on"}"#), Ok(DeviceStatus::On));
        assert_eq!(parse_status(br#"{"action":"OFF"}"#), Ok(DeviceStatus::Off));
        assert_eq!(parse_status(br#"{"status":1}"#), Ok(DeviceStatus::On));
    }

    #[test]
    fn status_scalar_forms() {
        assert_eq!(parse_status(b"1"), Ok(DeviceStatus::On));
        assert_eq!(parse_status(b"0"), Ok(DeviceStatus::Off));
        assert_eq!(parse_status(b"  on \n"), Ok(DeviceStatus::On));
        assert_eq!(parse_status(br#""off""#), Ok(DeviceStatus::Off));
    }

    #[test]
    fn status_garbage() {
        assert!(parse_status(b"toggle").is_err());
        assert!(parse_status(br#"{"state":"on"}"#).is_err());
        assert!(parse_status(b"2").is_err());
        assert!(parse_status(b"").is_err());
    }
}
