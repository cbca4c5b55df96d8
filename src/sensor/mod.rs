//! # Synthetic Sensor Traffic
//!
//! Sensor types, reading payloads and the lazy stream that feeds the
//! orchestrator. The per-device statistical models live in `models`, the
//! stream and its pacing in `stream`.

pub mod models;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use models::{ClientState, PirState};
pub use stream::{InterArrival, SensorStream, StreamConfig, StreamItem};

/// Kind of simulated sensor attached to a device
///
/// Parsing accepts the common aliases (`temp`/`temperature`, `pir`/`motion`,
/// ...). Unknown names become `Generic` and get a uniform 0-100 value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Motion,
    Light,
    Pressure,
    Gps,
    Accelerometer,
    Gyroscope,
    Camera,
    Sound,
    Vibration,
    Co2,
    Voltage,
    Generic(String),
}

impl SensorKind {
    /// Canonical short name, used in device ids
    pub fn name(&self) -> &str {
        match self {
            SensorKind::Temperature => "temp",
            SensorKind::Humidity => "humidity",
            SensorKind::Motion => "motion",
            SensorKind::Light => "light",
            SensorKind::Pressure => "pressure",
            SensorKind::Gps => "gps",
            SensorKind::Accelerometer => "accel",
            SensorKind::Gyroscope => "gyro",
            SensorKind::Camera => "camera",
            SensorKind::Sound => "sound",
            SensorKind::Vibration => "vibration",
            SensorKind::Co2 => "co2",
            SensorKind::Voltage => "voltage",
            SensorKind::Generic(name) => name,
        }
    }
}

impl FromStr for SensorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "temp" | "temperature" => SensorKind::Temperature,
            "humidity" => SensorKind::Humidity,
            "motion" | "pir" => SensorKind::Motion,
            "light" | "lux" => SensorKind::Light,
            "pressure" => SensorKind::Pressure,
            "gps" | "location" => SensorKind::Gps,
            "accel" | "accelerometer" => SensorKind::Accelerometer,
            "gyro" | "gyroscope" => SensorKind::Gyroscope,
            "camera" | "image" => SensorKind::Camera,
            "sound" | "audio" => SensorKind::Sound,
            "vibration" => SensorKind::Vibration,
            "co2" => SensorKind::Co2,
            "voltage" => SensorKind::Voltage,
            other => SensorKind::Generic(other.to_string()),
        };
        Ok(kind)
    }
}

impl From<String> for SensorKind {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<SensorKind> for String {
    fn from(kind: SensorKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a comma-separated sensor list such as `temp,humidity` or the
/// weighted form `temp:40,humidity:30`
///
/// Weights are ignored and duplicates dropped, keeping first-seen order.
pub fn parse_sensor_list(list: &str) -> Vec<SensorKind> {
    let mut sensors: Vec<SensorKind> = Vec::new();
    for item in list.split(',') {
        let name = item.split(':').next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let kind = SensorKind::from(name.to_string());
        if !sensors.contains(&kind) {
            sensors.push(kind);
        }
    }
    sensors
}

/// Measured value carried in a reading's `sensor_data` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorPayload {
    Generic {
        value: f64,
        #[serde(rename = "type")]
        kind: String,
        unit: String,
    },
    Scalar {
        value: f64,
        unit: String,
    },
    Motion {
        detected: bool,
        state: PirState,
    },
    Location {
        latitude: f64,
        longitude: f64,
        velocity_mps: f64,
    },
    Axes {
        x: f64,
        y: f64,
        z: f64,
        unit: String,
    },
    Image {
        resolution: String,
        format: String,
        size_kb: u32,
    },
    Sound {
        level: f64,
        unit: String,
    },
    Vibration {
        frequency: f64,
        amplitude: f64,
        unit: String,
    },
}

/// One reading as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "dev_id")]
    pub device_id: String,
    pub client_id: String,
    /// Seconds since the Unix epoch
    #[serde(rename = "ts")]
    pub timestamp: f64,
    #[serde(rename = "seq_no")]
    pub sequence_number: u64,
    #[serde(rename = "sensor_data")]
    pub payload: SensorPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl SensorReading {
    /// JSON bytes handed to `ProtocolAdapter::send_data`
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
