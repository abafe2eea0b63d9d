//! Domain types shared by the stores, the controllers and the HTTP layer:
//! device types and modes, per-device sensor configuration, schedule
//! entries and the validation rules applied before anything is persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A rule violation caught at the store-write boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("minThreshold ({min}) must be less than maxThreshold ({max})")]
    ThresholdOrder { min: f64, max: f64 },
    #[error("threshold {0} out of range [0, 100]")]
    ThresholdRange(f64),
    #[error("checkInterval {0}s out of range [10, 3600]")]
    CheckInterval(u32),
    #[error("invalid time '{0}' (expected HH:mm)")]
    Time(String),
    #[error("custom repeat requires at least one day")]
    EmptyCustomDays,
    #[error("unknown {kind} '{value}'")]
    Unknown { kind: &'static str, value: String },
    #[error("the global record has no sensor configuration")]
    GlobalSensorConfig,
    #[error("schedules can only target pump, fan or lamp")]
    GlobalSchedule,
}

fn unknown(kind: &'static str, value: &str) -> ValidationError {
    ValidationError::Unknown {
        kind,
        value: value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Pump,
    Fan,
    Lamp,
    Global,
}

impl DeviceType {
    /// The controllable actuators, i.e. every device type except `global`.
    pub const ACTUATORS: [DeviceType; 3] = [DeviceType::Pump, DeviceType::Fan, DeviceType::Lamp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Fan => "fan",
            Self::Lamp => "lamp",
            Self::Global => "global",
        }
    }

    pub fn is_actuator(self) -> bool {
        self != Self::Global
    }

    /// Sensor kind a device is driven by when it enters sensor mode without
    /// an explicit configuration.
    pub fn default_sensor(self) -> Option<SensorKind> {
        match self {
            Self::Pump => Some(SensorKind::SoilMoisture),
            Self::Fan => Some(SensorKind::Temperature),
            Self::Lamp => Some(SensorKind::Light),
            Self::Global => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pump" => Ok(Self::Pump),
            "fan" => Ok(Self::Fan),
            "lamp" => Ok(Self::Lamp),
            "global" => Ok(Self::Global),
            _ => Err(unknown("device type", s)),
        }
    }
}

/// Which control authority owns a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Schedule,
    Sensor,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Sensor => "sensor",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "schedule" => Ok(Self::Schedule),
            "sensor" => Ok(Self::Sensor),
            _ => Err(unknown("mode", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    SoilMoisture,
    Light,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soilMoisture",
            Self::Light => "light",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity | Self::SoilMoisture | Self::Light => "%",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "soilMoisture" => Ok(Self::SoilMoisture),
            "light" => Ok(Self::Light),
            _ => Err(unknown("sensor type", s)),
        }
    }
}

/// Desired actuator state carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Wire value used in control payloads.
    pub fn bit(self) -> u8 {
        match self {
            Self::On => 1,
            Self::Off => 0,
        }
    }

    pub fn from_bit(bit: i64) -> Option<Self> {
        match bit {
            1 => Some(Self::On),
            0 => Some(Self::Off),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(unknown("action", s)),
        }
    }
}

/// Last known on/off state of an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    On,
    Off,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// True when the device is already known to be in the state `action`
    /// would put it in. `Unknown` never matches.
    pub fn satisfies(self, action: Action) -> bool {
        matches!(
            (self, action),
            (DeviceStatus::On, Action::On) | (DeviceStatus::Off, Action::Off)
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Action> for DeviceStatus {
    fn from(action: Action) -> Self {
        match action {
            Action::On => Self::On,
            Action::Off => Self::Off,
        }
    }
}

// ---------------------------------------------------------------------------
// Device mode configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_SENSOR: SensorKind = SensorKind::Humidity;
pub const DEFAULT_MIN_THRESHOLD: f64 = 30.0;
pub const DEFAULT_MAX_THRESHOLD: f64 = 70.0;
pub const DEFAULT_CHECK_INTERVAL: u32 = 60;

const CHECK_INTERVAL_RANGE: std::ops::RangeInclusive<u32> = 10..=3600;
const THRESHOLD_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorConfig {
    pub sensor_type: SensorKind,
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// Seconds between two evaluations.
    pub check_interval: u32,
}

impl SensorConfig {
    /// Factory thresholds for a device type.
    pub fn default_for(device: DeviceType) -> Self {
        let (min, max) = match device {
            DeviceType::Fan => (28.0, 35.0),
            DeviceType::Lamp => (20.0, 80.0),
            _ => (DEFAULT_MIN_THRESHOLD, DEFAULT_MAX_THRESHOLD),
        };
        Self {
            sensor_type: device.default_sensor().unwrap_or(DEFAULT_SENSOR),
            min_threshold: min,
            max_threshold: max,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for t in [self.min_threshold, self.max_threshold] {
            if !THRESHOLD_RANGE.contains(&t) {
                return Err(ValidationError::ThresholdRange(t));
            }
        }
        if self.min_threshold >= self.max_threshold {
            return Err(ValidationError::ThresholdOrder {
                min: self.min_threshold,
                max: self.max_threshold,
            });
        }
        if !CHECK_INTERVAL_RANGE.contains(&self.check_interval) {
            return Err(ValidationError::CheckInterval(self.check_interval));
        }
        Ok(())
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor_type: DEFAULT_SENSOR,
            min_threshold: DEFAULT_MIN_THRESHOLD,
            max_threshold: DEFAULT_MAX_THRESHOLD,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Persisted per-device-type operating record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModeConfig {
    pub device_type: DeviceType,
    pub mode: Mode,
    pub sync_mode: bool,
    pub sensor_config: Option<SensorConfig>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub updated_by: Option<String>,
}

impl DeviceModeConfig {
    /// The record created lazily the first time a device type is accessed.
    pub fn new_default(device: DeviceType, now: OffsetDateTime) -> Self {
        Self {
            device_type: device,
            mode: Mode::Manual,
            sync_mode: device == DeviceType::Global,
            sensor_config: device.is_actuator().then(|| SensorConfig::default_for(device)),
            is_active: true,
            last_updated: now,
            updated_by: None,
        }
    }

    /// Sensor configuration with the documented fallbacks filled in.
    pub fn effective_sensor_config(&self) -> SensorConfig {
        self.sensor_config.clone().unwrap_or_default()
    }

    /// Merge a partial update into this record and validate the result.
    /// On error the record is left untouched.
    pub fn apply(&mut self, patch: &ModePatch, now: OffsetDateTime) -> Result<(), ValidationError> {
        let mut next = self.clone();

        if let Some(mode) = patch.mode {
            next.mode = mode;
        }
        if let Some(sync) = patch.sync_mode {
            next.sync_mode = sync;
        }
        if let Some(active) = patch.is_active {
            next.is_active = active;
        }
        if let Some(sc) = &patch.sensor_config {
            if !next.device_type.is_actuator() {
                return Err(ValidationError::GlobalSensorConfig);
            }
            let base = next
                .sensor_config
                .take()
                .unwrap_or_else(|| SensorConfig::default_for(next.device_type));
            next.sensor_config = Some(sc.merge(base));
        }
        if next.mode == Mode::Sensor && next.sensor_config.is_none() && next.device_type.is_actuator()
        {
            next.sensor_config = Some(SensorConfig::default_for(next.device_type));
        }
        if patch.updated_by.is_some() {
            next.updated_by = patch.updated_by.clone();
        }
        next.last_updated = now;

        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.sensor_config {
            Some(_) if !self.device_type.is_actuator() => Err(ValidationError::GlobalSensorConfig),
            Some(sc) => sc.validate(),
            None => Ok(()),
        }
    }
}

/// Partial update of a [`DeviceModeConfig`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModePatch {
    pub mode: Option<Mode>,
    pub sync_mode: Option<bool>,
    pub sensor_config: Option<SensorConfigPatch>,
    pub is_active: Option<bool>,
    pub updated_by: Option<String>,
}

impl ModePatch {
    pub fn mode(mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorConfigPatch {
    pub sensor_type: Option<SensorKind>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub check_interval: Option<u32>,
}

impl SensorConfigPatch {
    fn merge(&self, base: SensorConfig) -> SensorConfig {
        SensorConfig {
            sensor_type: self.sensor_type.unwrap_or(base.sensor_type),
            min_threshold: self.min_threshold.unwrap_or(base.min_threshold),
            max_threshold: self.max_threshold.unwrap_or(base.max_threshold),
            check_interval: self.check_interval.unwrap_or(base.check_interval),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Wall-clock minute of a schedule entry, always rendered as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn of(dt: OffsetDateTime) -> Self {
        Self {
            hour: dt.hour(),
            minute: dt.minute(),
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = ValidationError;

    /// Accepts `H:MM` and `HH:MM` in 24h notation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ValidationError::Time(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
        if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Day {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "Mon",
            Self::Tue => "Tue",
            Self::Wed => "Wed",
            Self::Thu => "Thu",
            Self::Fri => "Fri",
            Self::Sat => "Sat",
            Self::Sun => "Sun",
        }
    }

    pub fn is_weekend(self) -> bool {
        matches!(self, Self::Sat | Self::Sun)
    }
}

impl From<time::Weekday> for Day {
    fn from(w: time::Weekday) -> Self {
        use time::Weekday::*;
        match w {
            Monday => Self::Mon,
            Tuesday => Self::Tue,
            Wednesday => Self::Wed,
            Thursday => Self::Thu,
            Friday => Self::Fri,
            Saturday => Self::Sat,
            Sunday => Self::Sun,
        }
    }
}

impl FromStr for Day {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mon" => Ok(Self::Mon),
            "Tue" => Ok(Self::Tue),
            "Wed" => Ok(Self::Wed),
            "Thu" => Ok(Self::Thu),
            "Fri" => Ok(Self::Fri),
            "Sat" => Ok(Self::Sat),
            "Sun" => Ok(Self::Sun),
            _ => Err(unknown("day", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatKind {
    Daily,
    Weekdays,
    Custom,
    Once,
}

impl RepeatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekdays => "weekdays",
            Self::Custom => "custom",
            Self::Once => "once",
        }
    }
}

impl FromStr for RepeatKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekdays" => Ok(Self::Weekdays),
            "custom" => Ok(Self::Custom),
            "once" => Ok(Self::Once),
            _ => Err(unknown("repeat type", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repeat {
    #[serde(rename = "type")]
    pub kind: RepeatKind,
    #[serde(default)]
    pub days: Vec<Day>,
}

impl Repeat {
    pub fn daily() -> Self {
        Self {
            kind: RepeatKind::Daily,
            days: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind == RepeatKind::Custom && self.days.is_empty() {
            return Err(ValidationError::EmptyCustomDays);
        }
        Ok(())
    }
}

/// One persisted automation rule of the time scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub id: i64,
    pub device_type: DeviceType,
    pub action: Action,
    pub time: ClockTime,
    pub repeat: Repeat,
    pub is_active: bool,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
}

/// Validated input for a new schedule entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub device_type: DeviceType,
    pub action: Action,
    pub time: ClockTime,
    pub repeat: Repeat,
    pub is_active: bool,
    pub description: Option<String>,
    pub next_run: Option<OffsetDateTime>,
}

/// Listing filter for schedule entries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleFilter {
    pub device_type: Option<DeviceType>,
    pub action: Option<Action>,
    pub is_active: Option<bool>,
}

impl ScheduleFilter {
    pub fn matches(&self, entry: &ScheduleEntry) -> bool {
        self.device_type.map_or(true, |d| d == entry.device_type)
            && self.action.map_or(true, |a| a == entry.action)
            && self.is_active.map_or(true, |a| a == entry.is_active)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-10-19 08:00 UTC);

    // -- Enums ---------------------------------------------------------------

    #[test]
    fn device_type_round_trips_through_str() {
        for d in [DeviceType::Pump, DeviceType::Fan, DeviceType::Lamp, DeviceType::Global] {
            assert_eq!(d.as_str().parse::<DeviceType>(), Ok(d));
        }
        assert!("heater".parse::<DeviceType>().is_err());
    }

    #[test]
    fn default_sensor_mapping() {
        assert_eq!(DeviceType::Pump.default_sensor(), Some(SensorKind::SoilMoisture));
        assert_eq!(DeviceType::Fan.default_sensor(), Some(SensorKind::Temperature));
        assert_eq!(DeviceType::Lamp.default_sensor(), Some(SensorKind::Light));
        assert_eq!(DeviceType::Global.default_sensor(), None);
    }

    #[test]
    fn sensor_kind_serializes_camel_case() {
        let json = serde_json::to_string(&SensorKind::SoilMoisture).unwrap();
        assert_eq!(json, "\"soilMoisture\"");
    }

    #[test]
    fn unknown_status_never_satisfies() {
        assert!(!DeviceStatus::Unknown.satisfies(Action::On));
        assert!(!DeviceStatus::Unknown.satisfies(Action::Off));
        assert!(DeviceStatus::On.satisfies(Action::On));
        assert!(!DeviceStatus::Off.satisfies(Action::On));
    }

    // -- Sensor config -------------------------------------------------------

    #[test]
    fn default_thresholds_per_device() {
        let fan = SensorConfig::default_for(DeviceType::Fan);
        assert_eq!((fan.min_threshold, fan.max_threshold), (28.0, 35.0));
        let lamp = SensorConfig::default_for(DeviceType::Lamp);
        assert_eq!(lamp.sensor_type, SensorKind::Light);
        assert_eq!(lamp.check_interval, 60);
    }

    #[test]
    fn threshold_order_enforced() {
        let sc = SensorConfig {
            min_threshold: 50.0,
            max_threshold: 50.0,
            ..SensorConfig::default()
        };
        assert!(matches!(sc.validate(), Err(ValidationError::ThresholdOrder { .. })));
    }

    #[test]
    fn check_interval_bounds() {
        let mut sc = SensorConfig::default();
        sc.check_interval = 9;
        assert_eq!(sc.validate(), Err(ValidationError::CheckInterval(9)));
        sc.check_interval = 3601;
        assert_eq!(sc.validate(), Err(ValidationError::CheckInterval(3601)));
        sc.check_interval = 10;
        assert!(sc.validate().is_ok());
        sc.check_interval = 3600;
        assert!(sc.validate().is_ok());
    }

    #[test]
    fn missing_sensor_config_resolves_to_documented_defaults() {
        let mut cfg = DeviceModeConfig::new_default(DeviceType::Pump, NOW);
        cfg.sensor_config = None;
        let sc = cfg.effective_sensor_config();
        assert_eq!(sc.sensor_type, SensorKind::Humidity);
        assert_eq!((sc.min_threshold, sc.max_threshold), (30.0, 70.0));
    }

    // -- Patching ------------------------------------------------------------

    #[test]
    fn apply_merges_partial_sensor_config() {
        let mut cfg = DeviceModeConfig::new_default(DeviceType::Fan, NOW);
        let patch = ModePatch {
            sensor_config: Some(SensorConfigPatch {
                max_threshold: Some(33.0),
                ..SensorConfigPatch::default()
            }),
            ..ModePatch::default()
        };
        cfg.apply(&patch, NOW).unwrap();
        let sc = cfg.sensor_config.unwrap();
        assert_eq!(sc.min_threshold, 28.0);
        assert_eq!(sc.max_threshold, 33.0);
        assert_eq!(sc.sensor_type, SensorKind::Temperature);
    }

    #[test]
    fn apply_rejects_inverted_thresholds_and_keeps_record() {
        let mut cfg = DeviceModeConfig::new_default(DeviceType::Pump, NOW);
        let before = cfg.clone();
        let patch = ModePatch {
            mode: Some(Mode::Sensor),
            sensor_config: Some(SensorConfigPatch {
                min_threshold: Some(80.0),
                ..SensorConfigPatch::default()
            }),
            ..ModePatch::default()
        };
        let later = datetime!(2026-10-19 09:00 UTC);
        assert!(cfg.apply(&patch, later).is_err());
        assert_eq!(cfg, before);
    }

    #[test]
    fn switching_to_sensor_fills_missing_config() {
        let mut cfg = DeviceModeConfig::new_default(DeviceType::Pump, NOW);
        cfg.sensor_config = None;
        cfg.apply(&ModePatch::mode(Mode::Sensor), NOW).unwrap();
        assert_eq!(
            cfg.sensor_config.map(|s| s.sensor_type),
            Some(SensorKind::SoilMoisture)
        );
    }

    #[test]
    fn global_rejects_sensor_config() {
        let mut cfg = DeviceModeConfig::new_default(DeviceType::Global, NOW);
        assert!(cfg.sync_mode);
        assert!(cfg.sensor_config.is_none());
        let patch = ModePatch {
            sensor_config: Some(SensorConfigPatch::default()),
            ..ModePatch::default()
        };
        assert_eq!(cfg.apply(&patch, NOW), Err(ValidationError::GlobalSensorConfig));
    }

    // -- Clock time ----------------------------------------------------------

    #[test]
    fn clock_time_parses_and_normalises() {
        assert_eq!("06:00".parse::<ClockTime>().unwrap().to_string(), "06:00");
        assert_eq!("6:05".parse::<ClockTime>().unwrap().to_string(), "06:05");
        assert_eq!("23:59".parse::<ClockTime>().unwrap().to_string(), "23:59");
    }

    #[test]
    fn clock_time_rejects_garbage() {
        for bad in ["24:00", "12:60", "12:5", "1200", "", ":30", "ab:cd", "012:00", "-1:00"] {
            assert!(bad.parse::<ClockTime>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn clock_time_serde_as_string() {
        let t: ClockTime = serde_json::from_str("\"7:30\"").unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"07:30\"");
        assert!(serde_json::from_str::<ClockTime>("\"25:00\"").is_err());
    }

    // -- Repeat --------------------------------------------------------------

    #[test]
    fn custom_repeat_requires_days() {
        let r = Repeat {
            kind: RepeatKind::Custom,
            days: vec![],
        };
        assert_eq!(r.validate(), Err(ValidationError::EmptyCustomDays));
        assert!(Repeat::daily().validate().is_ok());
    }

    #[test]
    fn repeat_deserializes_wire_shape() {
        let r: Repeat = serde_json::from_str(r#"{"type":"custom","days":["Mon","Fri"]}"#).unwrap();
        assert_eq!(r.kind, RepeatKind::Custom);
        assert_eq!(r.days, vec![Day::Mon, Day::Fri]);
        let r: Repeat = serde_json::from_str(r#"{"type":"daily"}"#).unwrap();
        assert!(r.days.is_empty());
    }

    #[test]
    fn weekday_conversion() {
        assert_eq!(Day::from(time::Weekday::Saturday), Day::Sat);
        assert!(Day::Sun.is_weekend());
        assert!(!Day::Wed.is_weekend());
    }
}
