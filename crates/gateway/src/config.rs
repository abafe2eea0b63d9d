//! TOML config file loading, validation, and seeding of device modes.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::info;

use crate::db::Db;
use crate::model::{DeviceModeConfig, DeviceType, Mode, ModePatch, SensorConfigPatch, SensorKind};
use crate::mqtt::Subscriptions;

const DEVICE_PLACEHOLDER: &str = "{device}";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub farm_id: String,
    /// Wall-clock offset of the farm, e.g. `+07:00`.
    pub utc_offset: String,
    pub telemetry_topic: String,
    pub status_topic: String,
    /// Control topic template; `{device}` is replaced by the farm id.
    pub control_topic: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            farm_id: "farm01".into(),
            utc_offset: "+07:00".into(),
            telemetry_topic: "serverfm/devices/+/telemetry".into(),
            status_topic: "device/+/status".into(),
            control_topic: "serverfm/devices/{device}/control".into(),
        }
    }
}

/// Initial record for one device type. Names stay strings so that typos
/// are reported together with every other violation.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_type: String,
    pub mode: Option<String>,
    pub sensor_type: Option<String>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub check_interval: Option<u32>,
    pub is_active: Option<bool>,
}

fn parse_offset(s: &str) -> Result<UtcOffset> {
    let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(s, &format).map_err(|e| anyhow!("utc_offset '{s}' is not ±HH:MM ({e})"))
}

impl GatewaySection {
    pub fn offset(&self) -> Result<UtcOffset> {
        parse_offset(&self.utc_offset)
    }

    pub fn control_topic(&self) -> String {
        self.control_topic.replace(DEVICE_PLACEHOLDER, &self.farm_id)
    }

    pub fn subscriptions(&self) -> Subscriptions {
        Subscriptions {
            telemetry: self.telemetry_topic.clone(),
            status: self.status_topic.clone(),
        }
    }
}

impl DeviceEntry {
    fn has_sensor_fields(&self) -> bool {
        self.sensor_type.is_some()
            || self.min_threshold.is_some()
            || self.max_threshold.is_some()
            || self.check_interval.is_some()
    }

    /// Build the record this entry seeds, or every reason it cannot.
    fn resolve(&self, now: OffsetDateTime) -> Result<DeviceModeConfig, Vec<String>> {
        let mut errors = Vec::new();

        let device = DeviceType::from_str(&self.device_type);
        let mode = self.mode.as_deref().map(Mode::from_str).transpose();
        let sensor = self
            .sensor_type
            .as_deref()
            .map(SensorKind::from_str)
            .transpose();

        if let Err(e) = &device {
            errors.push(e.to_string());
        }
        if let Err(e) = &mode {
            errors.push(e.to_string());
        }
        if let Err(e) = &sensor {
            errors.push(e.to_string());
        }
        let (Ok(device), Ok(mode), Ok(sensor_type)) = (device, mode, sensor) else {
            return Err(errors);
        };

        let patch = ModePatch {
            mode,
            is_active: self.is_active,
            sensor_config: self.has_sensor_fields().then(|| SensorConfigPatch {
                sensor_type,
                min_threshold: self.min_threshold,
                max_threshold: self.max_threshold,
                check_interval: self.check_interval,
            }),
            updated_by: Some("config".into()),
            ..ModePatch::default()
        };
        let mut cfg = DeviceModeConfig::new_default(device, now);
        match cfg.apply(&patch, now) {
            Ok(()) => Ok(cfg),
            Err(e) => Err(vec![e.to_string()]),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_gateway(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_gateway(&self, errors: &mut Vec<String>) {
        let g = &self.gateway;
        if g.farm_id.trim().is_empty() {
            errors.push("gateway: farm_id is empty".into());
        }
        if let Err(e) = g.offset() {
            errors.push(format!("gateway: {e}"));
        }
        if !g.control_topic.contains(DEVICE_PLACEHOLDER) {
            errors.push(format!(
                "gateway: control_topic '{}' has no {DEVICE_PLACEHOLDER} placeholder",
                g.control_topic
            ));
        }
        for (name, filter) in [("telemetry_topic", &g.telemetry_topic), ("status_topic", &g.status_topic)] {
            if filter.split('/').filter(|s| *s == "+").count() != 1 {
                errors.push(format!("gateway: {name} '{filter}' must contain exactly one '+'"));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        let now = OffsetDateTime::now_utc();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = if d.device_type.is_empty() {
                format!("devices[{i}]")
            } else {
                format!("device '{}'", d.device_type)
            };

            if !seen.insert(d.device_type.as_str()) {
                errors.push(format!("{ctx}: duplicate device entry"));
            }
            if let Err(reasons) = d.resolve(now) {
                errors.extend(reasons.into_iter().map(|r| format!("{ctx}: {r}")));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// all defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        info!(path, "no config file; using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed device modes that have no stored record yet. Existing records are
/// never overwritten.
pub async fn apply(config: &Config, db: &Db) -> Result<usize> {
    let now = OffsetDateTime::now_utc();
    let mut seeded = 0;
    for d in &config.devices {
        let cfg = d
            .resolve(now)
            .map_err(|reasons| anyhow!("device '{}': {}", d.device_type, reasons.join("; ")))?;
        if db
            .seed_mode(&cfg)
            .await
            .with_context(|| format!("failed to seed device '{}'", d.device_type))?
        {
            seeded += 1;
        }
    }

    info!(
        devices = config.devices.len(),
        seeded,
        "config applied"
    );

    Ok(seeded)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceModeStore;

    fn entry(device: &str) -> DeviceEntry {
        DeviceEntry {
            device_type: device.into(),
            mode: None,
            sensor_type: None,
            min_threshold: None,
            max_threshold: None,
            check_interval: None,
            is_active: None,
        }
    }

    fn config_with(devices: Vec<DeviceEntry>) -> Config {
        Config {
            gateway: GatewaySection::default(),
            devices,
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[gateway]
farm_id = "farm07"
utc_offset = "+07:00"

[[devices]]
device_type = "pump"
mode = "sensor"
sensor_type = "soilMoisture"
min_threshold = 35
max_threshold = 65
check_interval = 30

[[devices]]
device_type = "lamp"
mode = "schedule"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateway.farm_id, "farm07");
        assert_eq!(config.gateway.status_topic, "device/+/status");
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.gateway.control_topic(), "serverfm/devices/farm07/control");
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.gateway.farm_id, "farm01");
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load("/nonexistent/farm-gateway.toml").unwrap();
        assert!(config.devices.is_empty());
    }

    #[test]
    fn offset_parsing() {
        assert_eq!(parse_offset("+07:00").unwrap(), UtcOffset::from_hms(7, 0, 0).unwrap());
        assert_eq!(parse_offset("-03:30").unwrap(), UtcOffset::from_hms(-3, -30, 0).unwrap());
        assert!(parse_offset("7").is_err());
        assert!(parse_offset("07:00").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn rejects_bad_gateway_section() {
        let mut cfg = config_with(vec![]);
        cfg.gateway.farm_id = " ".into();
        cfg.gateway.utc_offset = "GMT+7".into();
        cfg.gateway.control_topic = "serverfm/control".into();
        cfg.gateway.telemetry_topic = "serverfm/devices/telemetry".into();
        assert_validation_err(&cfg, "4 errors");
        assert_validation_err(&cfg, "farm_id is empty");
        assert_validation_err(&cfg, "GMT+7");
        assert_validation_err(&cfg, "{device}");
        assert_validation_err(&cfg, "telemetry_topic");
    }

    #[test]
    fn rejects_unknown_names() {
        let mut d = entry("heater");
        d.mode = Some("auto".into());
        assert_validation_err(&config_with(vec![d]), "unknown device type 'heater'");

        let mut d = entry("pump");
        d.sensor_type = Some("co2".into());
        assert_validation_err(&config_with(vec![d]), "unknown sensor type 'co2'");
    }

    #[test]
    fn collects_every_name_error() {
        let mut d = entry("heater");
        d.mode = Some("auto".into());
        d.sensor_type = Some("co2".into());
        assert_validation_err(&config_with(vec![d]), "3 errors");
    }

    #[test]
    fn rejects_duplicate_devices() {
        assert_validation_err(
            &config_with(vec![entry("pump"), entry("pump")]),
            "duplicate device entry",
        );
    }

    #[test]
    fn rejects_bad_thresholds() {
        let mut d = entry("fan");
        d.min_threshold = Some(40.0);
        d.max_threshold = Some(30.0);
        assert_validation_err(&config_with(vec![d]), "must be less than");

        let mut d = entry("fan");
        d.max_threshold = Some(120.0);
        assert_validation_err(&config_with(vec![d]), "out of range");

        let mut d = entry("lamp");
        d.check_interval = Some(5);
        assert_validation_err(&config_with(vec![d]), "checkInterval 5s");
    }

    #[test]
    fn rejects_global_sensor_config() {
        let mut d = entry("global");
        d.min_threshold = Some(10.0);
        assert_validation_err(&config_with(vec![d]), "no sensor configuration");
    }

    #[test]
    fn partial_sensor_fields_merge_with_device_defaults() {
        let mut d = entry("fan");
        d.max_threshold = Some(33.0);
        let cfg = d.resolve(OffsetDateTime::now_utc()).unwrap();
        let sc = cfg.sensor_config.unwrap();
        assert_eq!(sc.sensor_type, SensorKind::Temperature);
        assert_eq!((sc.min_threshold, sc.max_threshold), (28.0, 33.0));
    }

    // -- Apply ------------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_only_missing_devices() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_mode(DeviceType::Lamp, &ModePatch::mode(Mode::Schedule), OffsetDateTime::now_utc())
            .await
            .unwrap();

        let mut pump = entry("pump");
        pump.mode = Some("sensor".into());
        let mut lamp = entry("lamp");
        lamp.mode = Some("manual".into());
        let cfg = config_with(vec![pump, lamp]);

        assert_eq!(apply(&cfg, &db).await.unwrap(), 1);
        assert_eq!(db.get_mode(DeviceType::Pump).await.unwrap().mode, Mode::Sensor);
        // The operator's choice survives a restart.
        assert_eq!(db.get_mode(DeviceType::Lamp).await.unwrap().mode, Mode::Schedule);

        assert_eq!(apply(&cfg, &db).await.unwrap(), 0);
    }
}
