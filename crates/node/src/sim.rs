//! Weather simulator standing in for the rack's sensor node.
//!
//! Models what the node's sensors would see:
//! - Diurnal temperature/humidity cycle with a slow random walk on top
//! - Light from an inverted LDR divider (high raw value = dark)
//! - Rain episodes as a two-state Markov chain; rain cools, wets and darkens
//! - Derived heat index and dew point, as the firmware reports them

use std::f64::consts::PI;
use std::fmt;

use time::macros::format_description;
use time::PrimitiveDateTime;

/// Full-scale reading of the node's 12-bit ADC.
pub const ADC_MAX: i64 = 4095;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Clear, warm days; rain is rare and short.
    Sunny,
    /// Overcast and mild; light never gets very bright.
    Cloudy,
    /// Long, frequent showers.
    Rainy,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloudy" => Self::Cloudy,
            "rainy" => Self::Rainy,
            _ => Self::Sunny,
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Sunny => Profile {
                temp_mean: 29.0,
                temp_amplitude: 5.0,
                humidity_mean: 60.0,
                cloud_cover: 0.1,
                rain_start: 0.01,
                rain_stop: 0.3,
            },
            Self::Cloudy => Profile {
                temp_mean: 25.0,
                temp_amplitude: 3.0,
                humidity_mean: 72.0,
                cloud_cover: 0.6,
                rain_start: 0.05,
                rain_stop: 0.2,
            },
            Self::Rainy => Profile {
                temp_mean: 23.0,
                temp_amplitude: 2.0,
                humidity_mean: 85.0,
                cloud_cover: 0.8,
                rain_start: 0.25,
                rain_stop: 0.05,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sunny => write!(f, "sunny"),
            Self::Cloudy => write!(f, "cloudy"),
            Self::Rainy => write!(f, "rainy"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Profile {
    temp_mean: f64,
    temp_amplitude: f64,
    humidity_mean: f64,
    /// 0 = clear sky, 1 = fully overcast.
    cloud_cover: f64,
    /// Per-sample probability that a dry spell turns into rain.
    rain_start: f64,
    /// Per-sample probability that rain stops.
    rain_stop: f64,
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub light: i64,
    pub rain: bool,
    pub heat_index: f64,
    pub dew_point: f64,
}

impl Reading {
    /// Encode in the node's wire format.
    pub fn to_payload(&self, at: PrimitiveDateTime) -> String {
        let layout = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let mut payload = format!(
            "suhu:{:.1},kelembapan:{:.1},cahaya_analog:{},hujan:{},heat_index:{:.1},dew_point:{:.1}",
            self.temperature,
            self.humidity,
            self.light,
            if self.rain { "hujan" } else { "tidak hujan" },
            self.heat_index,
            self.dew_point,
        );
        // A node without a synced clock simply omits the field.
        if let Ok(ts) = at.format(layout) {
            payload.push_str(",waktu:");
            payload.push_str(&ts);
        }
        payload
    }
}

/// Magnus approximation, °C.
pub fn dew_point(temperature: f64, humidity: f64) -> f64 {
    const A: f64 = 17.27;
    const B: f64 = 237.7;
    let gamma = A * temperature / (B + temperature) + (humidity.max(1.0) / 100.0).ln();
    B * gamma / (A - gamma)
}

/// Rothfusz regression, converted to and from °F. Below 27 °C the plain
/// temperature is returned.
pub fn heat_index(temperature: f64, humidity: f64) -> f64 {
    if temperature < 27.0 {
        return temperature;
    }
    let t = temperature * 9.0 / 5.0 + 32.0;
    let r = humidity;
    let hi = -42.379 + 2.049_015_23 * t + 10.143_331_27 * r
        - 0.224_755_41 * t * r
        - 0.006_837_83 * t * t
        - 0.054_817_17 * r * r
        + 0.001_228_74 * t * t * r
        + 0.000_852_82 * t * r * r
        - 0.000_001_99 * t * t * r * r;
    (hi - 32.0) * 5.0 / 9.0
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct WeatherSim {
    profile: Profile,
    raining: bool,
    /// Slow random-walk offsets on top of the diurnal cycle.
    temp_drift: f64,
    humidity_drift: f64,
}

impl WeatherSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            profile: scenario.profile(),
            raining: false,
            temp_drift: 0.0,
            humidity_drift: 0.0,
        }
    }

    /// Produce the next reading at local hour-of-day `hour` (0.0..24.0).
    pub fn sample(&mut self, hour: f64) -> Reading {
        let p = self.profile;

        // -- Rain episodes ------------------------------------------------
        let flip = if self.raining { p.rain_stop } else { p.rain_start };
        if fastrand::f64() < flip {
            self.raining = !self.raining;
        }

        // -- Temperature / humidity ---------------------------------------
        self.temp_drift = (self.temp_drift * 0.95 + gaussian(0.0, 0.2)).clamp(-3.0, 3.0);
        self.humidity_drift = (self.humidity_drift * 0.95 + gaussian(0.0, 0.8)).clamp(-10.0, 10.0);

        // Warmest around 14:00, coolest around 02:00.
        let diurnal = (2.0 * PI * (hour - 8.0) / 24.0).sin();
        let mut temperature = p.temp_mean + p.temp_amplitude * diurnal + self.temp_drift;
        let mut humidity = p.humidity_mean - 12.0 * diurnal + self.humidity_drift;
        if self.raining {
            temperature -= 3.0;
            humidity += 20.0;
        }
        let temperature = temperature.clamp(0.0, 50.0);
        let humidity = humidity.clamp(0.0, 100.0);

        // -- Light (inverted LDR) -----------------------------------------
        let daylight = daylight(hour);
        let clouds = if self.raining { 0.9 } else { p.cloud_cover };
        let brightness = daylight * (1.0 - 0.7 * clouds);
        let raw = ADC_MAX as f64 * (1.0 - 0.95 * brightness) + gaussian(0.0, 40.0);
        let light = (raw.round() as i64).clamp(0, ADC_MAX);

        Reading {
            temperature: round1(temperature),
            humidity: round1(humidity),
            light,
            rain: self.raining,
            heat_index: round1(heat_index(temperature, humidity)),
            dew_point: round1(dew_point(temperature, humidity)),
        }
    }
}

/// 0 at night, rising to 1 at solar noon, for a 06:00-18:00 day.
fn daylight(hour: f64) -> f64 {
    if (6.0..=18.0).contains(&hour) {
        (PI * (hour - 6.0) / 12.0).sin()
    } else {
        0.0
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
