mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FarmSim, Scenario};

/// Decode a control payload such as `{"pump":1}`. Every key must name an
/// actuator and carry 0 or 1.
fn parse_command(payload: &[u8]) -> Result<Vec<(String, bool)>, String> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| format!("not json: {e}"))?;
    let map = value.as_object().ok_or("command is not an object")?;
    map.iter()
        .map(|(device, v)| match (device.as_str(), v.as_i64()) {
            ("pump" | "lamp" | "fan", Some(1)) => Ok((device.clone(), true)),
            ("pump" | "lamp" | "fan", Some(0)) => Ok((device.clone(), false)),
            ("pump" | "lamp" | "fan", _) => Err(format!("bad value for {device}: {v}")),
            _ => Err(format!("unknown device '{device}'")),
        })
        .collect()
}

fn status_payload(on: bool) -> Vec<u8> {
    json!({ "status": if on { "on" } else { "off" } })
        .to_string()
        .into_bytes()
}

fn lock(sim: &Mutex<FarmSim>) -> std::sync::MutexGuard<'_, FarmSim> {
    sim.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let farm_id = env::var("FARM_ID").unwrap_or_else(|_| "farm01".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let diurnal_period_s: f64 = env::var("DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    let sim = Arc::new(Mutex::new(FarmSim::new(scenario, diurnal_period_s)));
    info!(%farm_id, %scenario, sample_every_s, "farm node starting");

    let mut mqttoptions = MqttOptions::new(format!("farm-node-{farm_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let control_topic = format!("serverfm/devices/{farm_id}/control");
    let telemetry_topic = format!("serverfm/devices/{farm_id}/telemetry");

    // Event loop: (re)subscribe on connect, obey commands, echo status.
    let loop_client = client.clone();
    let loop_sim = sim.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %control_topic, "connected; subscribing");
                    if let Err(e) = loop_client.try_subscribe(control_topic.as_str(), QoS::AtLeastOnce) {
                        warn!(error = %e, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == control_topic => {
                    match parse_command(&p.payload) {
                        Ok(cmds) => {
                            for (device, on) in cmds {
                                lock(&loop_sim).set_actuator(&device, on);
                                info!(%device, on, "actuator set");
                                let topic = format!("device/{device}/status");
                                if let Err(e) = loop_client.try_publish(
                                    topic,
                                    QoS::AtLeastOnce,
                                    false,
                                    status_payload(on),
                                ) {
                                    warn!(%device, error = %e, "status echo failed");
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring control message"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error; retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(topic = %telemetry_topic, "publishing telemetry");
    loop {
        let frame = {
            let mut sim = lock(&sim);
            let sample = sim.step(sample_every_s as f64);
            sample.frame(sim.actuators())
        };

        match client
            .publish(&telemetry_topic, QoS::AtLeastOnce, false, frame.to_string())
            .await
        {
            Ok(()) => debug!(%frame, "published telemetry"),
            Err(e) => warn!(error = %e, "publish error"),
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
