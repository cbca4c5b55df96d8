//! Per-device statistical sensor models
//!
//! Temperature follows a discretised Ornstein-Uhlenbeck process with a
//! physical rate-of-change bound, humidity is anti-correlated with the
//! device temperature, PIR sensors obey the HC-SR501 dwell and blocking
//! windows, accelerometer noise follows the MPU-6050 noise density, and GPS
//! positions move by a velocity-bounded random walk. Inter-arrival times are
//! Weibull distributed.

use super::{SensorKind, SensorPayload};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// OU mean-reversion rate
pub const TEMP_THETA: f64 = 0.1;
/// OU volatility
pub const TEMP_SIGMA: f64 = 0.5;
/// Largest temperature change per step: 0.5 °C per minute
pub const TEMP_MAX_STEP: f64 = 0.5 / 60.0;

/// PIR stays "detected" this long after a trigger (seconds)
pub const PIR_DWELL: f64 = 3.0;
/// PIR cannot re-trigger for this long after the dwell window (seconds)
pub const PIR_BLOCKING: f64 = 2.5;
/// Minimum spacing between two triggers
pub const PIR_MIN_INTERVAL: f64 = PIR_DWELL + PIR_BLOCKING;
/// Chance of a trigger per generation call while idle
pub const PIR_TRIGGER_PROBABILITY: f64 = 0.3;

/// Accelerometer noise spectral density, m/s²/√Hz
pub const ACCEL_NSD: f64 = 0.004;
/// Accelerometer bandwidth, Hz
pub const ACCEL_BANDWIDTH: f64 = 260.0;
pub const GRAVITY: f64 = 9.81;

/// Metres per degree of latitude
pub const METRES_PER_DEGREE: f64 = 111_000.0;
/// GPS step length in seconds
pub const GPS_DT: f64 = 1.0;
/// Walk, cycle and drive speed archetypes (m/s)
pub const GPS_VMAX_CHOICES: [f64; 3] = [1.5, 5.0, 15.0];

/// RMS accelerometer noise, `NSD × √(BW × 1.6)`
pub fn accel_rms_noise() -> f64 {
    ACCEL_NSD * (ACCEL_BANDWIDTH * 1.6).sqrt()
}

/// Standard normal sample via the Box-Muller transform
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // gen::<f64>() is in [0, 1); 1 - u keeps ln() away from zero
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    mean + std_dev * standard_normal(rng)
}

/// Weibull inter-arrival time: `scale × (−ln U)^(1/k)`, U in (0, 1]
pub fn weibull_interval<R: Rng + ?Sized>(rng: &mut R, shape: f64, scale: f64) -> f64 {
    let u = (1.0 - rng.gen::<f64>()).max(1e-10);
    scale * (-u.ln()).powf(1.0 / shape)
}

/// One OU step with the per-step delta clamped to `±TEMP_MAX_STEP`
pub fn ou_temperature_step<R: Rng + ?Sized>(rng: &mut R, current: f64, mean: f64) -> f64 {
    let delta = TEMP_THETA * (mean - current) + TEMP_SIGMA * standard_normal(rng);
    current + delta.clamp(-TEMP_MAX_STEP, TEMP_MAX_STEP)
}

/// Humidity anti-correlated with temperature, clamped to [0, 100]
pub fn humidity_from_temperature<R: Rng + ?Sized>(rng: &mut R, temperature: f64) -> f64 {
    let base = 60.0 - (temperature - 20.0) * 1.5;
    gaussian(rng, base, 3.0).clamp(0.0, 100.0)
}

/// State reported by a PIR sensor at one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PirState {
    Idle,
    /// A new detection started at this reading
    Triggered,
    Dwell,
    Blocking,
}

impl PirState {
    pub fn detected(self) -> bool {
        matches!(self, PirState::Triggered | PirState::Dwell)
    }
}

/// Mutable per-device state carrying temporal correlation between readings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub temp_mean: f64,
    pub temp_current: f64,
    /// Stream time of the last PIR trigger, seconds since stream start
    pub pir_last_trigger: Option<f64>,
    pub pir_state: PirState,
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub gps_vmax: f64,
}

impl ClientState {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            temp_mean: rng.gen_range(18.0..=28.0),
            temp_current: rng.gen_range(20.0..=25.0),
            pir_last_trigger: None,
            pir_state: PirState::Idle,
            gps_lat: 23.8 + rng.gen_range(-0.5..=0.5),
            gps_lon: 90.4 + rng.gen_range(-0.5..=0.5),
            gps_vmax: GPS_VMAX_CHOICES[rng.gen_range(0..GPS_VMAX_CHOICES.len())],
        }
    }

    /// Advance the PIR state machine to stream time `now`
    ///
    /// Windows are measured from the last trigger, so two triggers are
    /// always at least `PIR_MIN_INTERVAL` apart.
    pub fn pir_step<R: Rng + ?Sized>(&mut self, rng: &mut R, now: f64) -> PirState {
        let since = self.pir_last_trigger.map(|t| now - t);
        let next = match since {
            Some(elapsed) if elapsed < PIR_DWELL => PirState::Dwell,
            Some(elapsed) if elapsed < PIR_MIN_INTERVAL => PirState::Blocking,
            _ if rng.gen::<f64>() < PIR_TRIGGER_PROBABILITY => {
                self.pir_last_trigger = Some(now);
                PirState::Triggered
            }
            _ => PirState::Idle,
        };
        self.pir_state = next;
        next
    }

    /// Move the GPS position by at most `vmax × dt` metres
    ///
    /// Returns the speed actually used for the step.
    pub fn gps_step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let max_delta = self.gps_vmax * GPS_DT / METRES_PER_DEGREE;
        let angle = rng.gen_range(0.0..2.0 * PI);
        let speed = rng.gen::<f64>();
        self.gps_lat += max_delta * speed * angle.cos();
        self.gps_lon += max_delta * speed * angle.sin();
        self.gps_vmax * speed
    }

    /// Produce the next payload for a device of `kind`
    ///
    /// `now` is the stream time in seconds, used to gate PIR windows.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        kind: &SensorKind,
        now: f64,
    ) -> SensorPayload {
        match kind {
            SensorKind::Temperature => {
                self.temp_current = ou_temperature_step(rng, self.temp_current, self.temp_mean);
                scalar(self.temp_current, "C")
            }
            SensorKind::Humidity => {
                scalar(humidity_from_temperature(rng, self.temp_current), "%")
            }
            SensorKind::Motion => {
                let state = self.pir_step(rng, now);
                SensorPayload::Motion {
                    detected: state.detected(),
                    state,
                }
            }
            SensorKind::Light => scalar(rng.gen_range(0.0..=1000.0), "lux"),
            SensorKind::Pressure => scalar(bounded_gaussian(rng, 1013.0, 10.0, 950.0, 1080.0), "hPa"),
            SensorKind::Gps => {
                let velocity_mps = self.gps_step(rng);
                SensorPayload::Location {
                    latitude: self.gps_lat,
                    longitude: self.gps_lon,
                    velocity_mps,
                }
            }
            SensorKind::Accelerometer => {
                let sigma = accel_rms_noise();
                SensorPayload::Axes {
                    x: gaussian(rng, 0.0, sigma),
                    y: gaussian(rng, 0.0, sigma),
                    z: gaussian(rng, GRAVITY, sigma),
                    unit: "m/s²".to_string(),
                }
            }
            SensorKind::Gyroscope => SensorPayload::Axes {
                x: bounded_gaussian(rng, 0.0, 0.5, -250.0, 250.0),
                y: bounded_gaussian(rng, 0.0, 0.5, -250.0, 250.0),
                z: bounded_gaussian(rng, 0.0, 0.5, -250.0, 250.0),
                unit: "°/s".to_string(),
            },
            SensorKind::Camera => SensorPayload::Image {
                resolution: "1920x1080".to_string(),
                format: "JPEG".to_string(),
                size_kb: rng.gen_range(50..=500),
            },
            SensorKind::Sound => SensorPayload::Sound {
                level: bounded_gaussian(rng, 50.0, 15.0, 20.0, 120.0),
                unit: "dB".to_string(),
            },
            SensorKind::Vibration => SensorPayload::Vibration {
                frequency: rng.gen_range(10.0..=100.0),
                amplitude: rng.gen_range(0.0..=10.0),
                unit: "Hz".to_string(),
            },
            SensorKind::Co2 => scalar(bounded_gaussian(rng, 600.0, 100.0, 400.0, 5000.0), "ppm"),
            SensorKind::Voltage => scalar(bounded_gaussian(rng, 3.7, 0.2, 3.0, 4.2), "V"),
            SensorKind::Generic(name) => SensorPayload::Generic {
                value: rng.gen_range(0.0..=100.0),
                kind: name.clone(),
                unit: "generic".to_string(),
            },
        }
    }
}

fn scalar(value: f64, unit: &str) -> SensorPayload {
    SensorPayload::Scalar {
        value,
        unit: unit.to_string(),
    }
}

fn bounded_gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64, lo: f64, hi: f64) -> f64 {
    gaussian(rng, mean, std_dev).clamp(lo, hi)
}
