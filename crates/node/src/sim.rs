//! Stateful farm climate simulator for local development.
//!
//! Models a small greenhouse bed:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal (day/night) cycle on temperature, humidity and light
//! - Per-reading sensor noise
//! - Closed-loop actuator response (pump wets the soil, fan cools the air,
//!   lamp brightens the bed)

use serde_json::{json, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild climate around the middle of every default threshold band.
    Stable,
    /// Hot afternoon; temperature climbs past the fan's upper threshold.
    Hot,
    /// Soil dries quickly; the pump's lower threshold is crossed early.
    Dry,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "dry" => Self::Dry,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Hot => write!(f, "hot"),
            Self::Dry => write!(f, "dry"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One simulated quantity.
struct Channel {
    value: f64,
    center: f64,
    /// Per-step drift toward lower values (evaporation, heat loss).
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    min: f64,
    max: f64,
}

impl Channel {
    fn step(&mut self, push: f64) {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk - self.drift + push).clamp(self.min, self.max);
    }

    fn read(&self, diurnal: f64) -> f64 {
        let v = self.value + diurnal + gaussian(0.0, self.noise_sigma);
        (v.clamp(self.min, self.max) * 10.0).round() / 10.0
    }
}

/// Actuator states as last commanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actuators {
    pub pump: bool,
    pub lamp: bool,
    pub fan: bool,
}

impl Actuators {
    /// Set the actuator named `device`. Returns false for unknown names.
    pub fn set(&mut self, device: &str, on: bool) -> bool {
        match device {
            "pump" => self.pump = on,
            "lamp" => self.lamp = on,
            "fan" => self.fan = on,
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub light: f64,
}

impl Sample {
    /// Telemetry frame: `{"data":[temp, humi, soil, pump, lamp, fan, light]}`.
    pub fn frame(&self, act: Actuators) -> Value {
        json!({
            "data": [
                self.temperature,
                self.humidity,
                self.soil_moisture,
                u8::from(act.pump),
                u8::from(act.lamp),
                u8::from(act.fan),
                self.light,
            ]
        })
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct FarmSim {
    temperature: Channel,
    humidity: Channel,
    soil: Channel,
    light: Channel,
    actuators: Actuators,
    elapsed_s: f64,
    diurnal_period_s: f64,
}

impl FarmSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (temp_center, soil_center, soil_drift) = match scenario {
            Scenario::Stable => (30.0, 50.0, 0.05),
            Scenario::Hot => (36.0, 45.0, 0.1),
            Scenario::Dry => (31.0, 28.0, 0.4),
        };
        Self {
            temperature: Channel {
                value: temp_center,
                center: temp_center,
                drift: 0.0,
                walk_sigma: 0.2,
                mean_reversion: 0.05,
                noise_sigma: 0.1,
                min: -10.0,
                max: 60.0,
            },
            humidity: Channel {
                value: 60.0,
                center: 60.0,
                drift: 0.0,
                walk_sigma: 0.5,
                mean_reversion: 0.05,
                noise_sigma: 0.3,
                min: 0.0,
                max: 100.0,
            },
            soil: Channel {
                value: soil_center,
                center: soil_center,
                drift: soil_drift,
                walk_sigma: 0.3,
                mean_reversion: 0.01,
                noise_sigma: 0.2,
                min: 0.0,
                max: 100.0,
            },
            light: Channel {
                value: 40.0,
                center: 40.0,
                drift: 0.0,
                walk_sigma: 1.0,
                mean_reversion: 0.1,
                noise_sigma: 0.5,
                min: 0.0,
                max: 100.0,
            },
            actuators: Actuators::default(),
            elapsed_s: 0.0,
            diurnal_period_s: diurnal_period_s.max(1.0),
        }
    }

    pub fn actuators(&self) -> Actuators {
        self.actuators
    }

    pub fn set_actuator(&mut self, device: &str, on: bool) -> bool {
        self.actuators.set(device, on)
    }

    /// Advance the model by `dt_s` seconds and read every sensor.
    pub fn step(&mut self, dt_s: f64) -> Sample {
        self.elapsed_s += dt_s;
        let act = self.actuators;

        self.soil.step(if act.pump { 3.0 } else { 0.0 });
        self.temperature.step(if act.fan { -0.8 } else { 0.0 });
        self.humidity.step(if act.pump { 0.5 } else { 0.0 });
        self.light.step(0.0);

        // sin > 0 is daytime.
        let phase = (self.elapsed_s / self.diurnal_period_s) * std::f64::consts::TAU;
        let day = phase.sin();
        let lamp = if act.lamp { 35.0 } else { 0.0 };

        Sample {
            temperature: self.temperature.read(3.0 * day),
            humidity: self.humidity.read(-8.0 * day),
            soil_moisture: self.soil.read(0.0),
            light: self.light.read(30.0 * day + lamp),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn average_soil(sim: &mut FarmSim, steps: usize) -> f64 {
        (0..steps).map(|_| sim.step(5.0).soil_moisture).sum::<f64>() / steps as f64
    }

    #[test]
    fn scenario_parsing() {
        assert_eq!(Scenario::from_str_lossy("HOT"), Scenario::Hot);
        assert_eq!(Scenario::from_str_lossy("dry"), Scenario::Dry);
        assert_eq!(Scenario::from_str_lossy("anything"), Scenario::Stable);
        assert_eq!(Scenario::Hot.to_string(), "hot");
    }

    #[test]
    fn readings_stay_in_physical_range() {
        let mut sim = FarmSim::new(Scenario::Dry, 600.0);
        for _ in 0..2000 {
            let s = sim.step(5.0);
            assert!((0.0..=100.0).contains(&s.soil_moisture), "{s:?}");
            assert!((0.0..=100.0).contains(&s.humidity), "{s:?}");
            assert!((0.0..=100.0).contains(&s.light), "{s:?}");
            assert!((-10.0..=60.0).contains(&s.temperature), "{s:?}");
        }
    }

    #[test]
    fn pump_wets_the_soil() {
        let mut dry = FarmSim::new(Scenario::Dry, 600.0);
        let mut watered = FarmSim::new(Scenario::Dry, 600.0);
        watered.set_actuator("pump", true);
        assert!(average_soil(&mut watered, 100) > average_soil(&mut dry, 100) + 20.0);
    }

    #[test]
    fn fan_cools_the_air() {
        let mut sim = FarmSim::new(Scenario::Hot, 86_400.0);
        sim.set_actuator("fan", true);
        let cooled: f64 = (0..200).map(|_| sim.step(1.0).temperature).sum::<f64>() / 200.0;
        assert!(cooled < 36.0, "{cooled}");
    }

    #[test]
    fn unknown_actuator_is_rejected() {
        let mut sim = FarmSim::new(Scenario::Stable, 600.0);
        assert!(!sim.set_actuator("heater", true));
        assert_eq!(sim.actuators(), Actuators::default());
    }

    #[test]
    fn frame_has_seven_slots() {
        let sample = Sample {
            temperature: 30.5,
            humidity: 61.0,
            soil_moisture: 44.2,
            light: 12.0,
        };
        let act = Actuators {
            pump: true,
            lamp: false,
            fan: true,
        };
        assert_eq!(
            sample.frame(act),
            json!({ "data": [30.5, 61.0, 44.2, 1, 0, 1, 12.0] })
        );
    }
}
