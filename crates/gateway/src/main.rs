mod config;
mod control;
mod db;
mod error;
mod fanout;
mod ingest;
mod live;
mod model;
mod mqtt;
mod publisher;
mod scheduler;
mod sensor_controller;
mod state;
mod store;
mod web;

#[cfg(test)]
mod testutil;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use control::ControlPlane;
use db::Db;
use fanout::Fanout;
use ingest::Ingest;
use live::LiveState;
use publisher::CommandPublisher;
use scheduler::Scheduler;
use sensor_controller::SensorController;
use state::SystemState;

/// Realtime fan-out buffer per subscriber.
const FANOUT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:farm.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3000);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed device modes) ──────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let offset = cfg.gateway.offset()?;
    let subs = cfg.gateway.subscriptions();
    info!(
        farm = %cfg.gateway.farm_id,
        %offset,
        telemetry = %subs.telemetry,
        status = %subs.status,
        "gateway configured"
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("gateway started".to_string());
    let live = Arc::new(LiveState::new());
    let fanout = Fanout::new(FANOUT_CAPACITY);
    tokio::spawn(state::record_fanout_events(fanout.clone(), shared.clone()));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("farm-gateway", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        mqttoptions.set_credentials(user, pass);
    }
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let ingest = Arc::new(Ingest::new(
        db.clone(),
        live.clone(),
        fanout.clone(),
        shared.clone(),
        subs.clone(),
    ));
    tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        subs,
        ingest,
        shared.clone(),
    ));

    // ── Controllers ─────────────────────────────────────────────────
    let store = Arc::new(db.clone());
    let publisher = Arc::new(CommandPublisher::new(
        client,
        cfg.gateway.control_topic(),
        live.clone(),
    ));
    let sensors = SensorController::new(store.clone(), publisher.clone(), live.clone(), fanout.clone());
    let scheduler = Scheduler::new(store.clone(), publisher.clone(), fanout.clone(), offset);
    let control = Arc::new(ControlPlane::new(store, sensors, scheduler, publisher, fanout.clone()));
    if let Err(e) = control.start().await {
        // Stored sensor-mode devices stay idle until the next restart call.
        warn!(error = %format!("{e:#}"), "sensor controller failed to start");
        control.scheduler().start();
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        db,
        shared,
        live,
        control: control.clone(),
        fanout,
    };

    tokio::select! {
        res = web::serve(web_state, web_port) => {
            if let Err(e) = &res {
                error!(error = %format!("{e:#}"), "web server stopped");
            }
            control.shutdown();
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            control.shutdown();
            Ok(())
        }
    }
}
