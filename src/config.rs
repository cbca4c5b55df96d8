//! Run configuration
//!
//! A `RunConfig` is loaded once per run from a scenario file (or built ad hoc
//! by the CLI and the comparator) and is never mutated after the run starts.

use crate::protocol::FaultConfig;
use crate::sensor::SensorKind;
use crate::utils::duration_from_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Unparsable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Who drives the traffic during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// The orchestrator paces sends through the adapter
    #[default]
    Active,
    /// External binaries generate traffic and write a receive log
    Passive,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Active => write!(f, "active"),
            TransportMode::Passive => write!(f, "passive"),
        }
    }
}

/// Node role in a distributed deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receiving node: hosts the broker or listener
    #[default]
    Core,
    /// Sending node: runs simulated devices against a remote core
    Sensor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Core => write!(f, "core"),
            Role::Sensor => write!(f, "sensor"),
        }
    }
}

/// Commands for passive-mode adapters
///
/// `{ip}`, `{port}` and `{id}` in any argument are substituted before spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassiveCommands {
    #[serde(default)]
    pub server_command: Vec<String>,
    #[serde(default)]
    pub client_command: Vec<String>,
    /// File the server creates once it is listening
    #[serde(default)]
    pub ready_file: Option<PathBuf>,
}

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_duration() -> f64 {
    crate::defaults::DURATION_SECS
}

fn default_sensors() -> Vec<SensorKind> {
    vec![SensorKind::Temperature]
}

fn default_packets() -> usize {
    crate::defaults::PACKETS_PER_CLIENT
}

fn default_weibull_k() -> f64 {
    crate::defaults::WEIBULL_SHAPE
}

fn default_weibull_scale() -> f64 {
    crate::defaults::WEIBULL_SCALE
}

fn default_true() -> bool {
    true
}

fn default_rate() -> f64 {
    1.0
}

fn default_topic() -> String {
    crate::defaults::TOPIC.to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_send_timeout() -> f64 {
    crate::defaults::SEND_TIMEOUT_SECS
}

fn default_recv_log() -> PathBuf {
    PathBuf::from(crate::defaults::RECV_LOG)
}

/// Immutable configuration for one test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Scenario name, used to label result directories
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Registry key of the protocol adapter
    pub protocol: String,

    #[serde(default)]
    pub mode: TransportMode,

    #[serde(default = "default_server_ip")]
    pub server_ip: String,

    #[serde(default)]
    pub server_port: u16,

    /// Zero means server-only
    #[serde(default)]
    pub num_clients: usize,

    /// Run duration bound in seconds
    #[serde(default = "default_duration")]
    pub duration: f64,

    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorKind>,

    #[serde(default = "default_packets")]
    pub packets_per_client: usize,

    #[serde(default)]
    pub network_profile: Option<String>,

    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub role: Option<Role>,

    #[serde(default = "default_weibull_k")]
    pub weibull_k: f64,

    #[serde(default = "default_weibull_scale")]
    pub weibull_scale: f64,

    #[serde(default = "default_true")]
    pub use_weibull_iat: bool,

    /// Messages per second per stream when Weibull pacing is off
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Optional cap on each inter-arrival interval, in seconds
    #[serde(default)]
    pub max_interval: Option<f64>,

    /// Seed for the sensor stream; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Per-message send timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout: f64,

    #[serde(default = "default_recv_log")]
    pub recv_log: PathBuf,

    #[serde(default)]
    pub passive: PassiveCommands,

    /// Wraps the adapter in a `FaultInjector` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faults: Option<FaultConfig>,
}

impl RunConfig {
    /// Minimal active-mode configuration for `protocol`, every other field
    /// at its default.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            name: None,
            description: None,
            protocol: protocol.into(),
            mode: TransportMode::Active,
            server_ip: default_server_ip(),
            server_port: 0,
            num_clients: 0,
            duration: default_duration(),
            sensors: default_sensors(),
            packets_per_client: default_packets(),
            network_profile: None,
            node_id: None,
            role: None,
            weibull_k: default_weibull_k(),
            weibull_scale: default_weibull_scale(),
            use_weibull_iat: true,
            rate: default_rate(),
            max_interval: None,
            seed: None,
            topic: default_topic(),
            qos: default_qos(),
            send_timeout: default_send_timeout(),
            recv_log: default_recv_log(),
            passive: PassiveCommands::default(),
            faults: None,
        }
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Unparsable {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no run could honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.trim().is_empty() {
            return Err(ConfigError::MissingField("protocol"));
        }
        check_seconds("duration", self.duration)?;
        if self.sensors.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sensors",
                reason: "at least one sensor type is required".to_string(),
            });
        }
        if self.num_clients > 0 && self.packets_per_client == 0 {
            return Err(ConfigError::InvalidValue {
                field: "packets_per_client",
                reason: "must be non-zero when clients are configured".to_string(),
            });
        }
        if !(self.weibull_k > 0.0 && self.weibull_scale > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "weibull_k",
                reason: "shape and scale must both be positive".to_string(),
            });
        }
        if !self.use_weibull_iat {
            if !(self.rate.is_finite() && self.rate > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "rate",
                    reason: format!("must be positive for fixed pacing, got {}", self.rate),
                });
            }
            check_seconds("rate", 1.0 / self.rate)?;
        }
        if let Some(max) = self.max_interval {
            check_seconds("max_interval", max)?;
        }
        if self.qos > 1 {
            return Err(ConfigError::InvalidValue {
                field: "qos",
                reason: format!("only 0 and 1 are supported, got {}", self.qos),
            });
        }
        if let Some(faults) = &self.faults {
            if !faults.is_valid() {
                return Err(ConfigError::InvalidValue {
                    field: "faults",
                    reason: "probabilities must lie in [0, 1]".to_string(),
                });
            }
        }
        check_seconds("send_timeout", self.send_timeout)?;
        Ok(())
    }

    /// Configured role, `core` when unset
    pub fn effective_role(&self) -> Role {
        self.role.unwrap_or_default()
    }

    /// Node identity stamped on payloads and summaries
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| self.effective_role().to_string())
    }

    pub fn duration(&self) -> Duration {
        duration_from_secs(self.duration)
    }

    pub fn send_timeout(&self) -> Duration {
        duration_from_secs(self.send_timeout)
    }

    /// Label for result directories: the scenario name, else `adhoc`
    pub fn scenario_name(&self) -> &str {
        self.name.as_deref().unwrap_or("adhoc")
    }

    pub fn expected_packets(&self) -> usize {
        self.num_clients * self.packets_per_client
    }
}

/// Positive number of seconds that a deadline from now can hold
fn check_seconds(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be a positive number of seconds, got {}", secs),
        });
    }
    let fits = Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|duration| std::time::Instant::now().checked_add(duration))
        .is_some();
    if !fits {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("{} seconds is out of range", secs),
        });
    }
    Ok(())
}

/// Load `<dir>/<name>.json` as a scenario
pub fn load_scenario(dir: impl AsRef<Path>, name: &str) -> Result<RunConfig, ConfigError> {
    let path = dir.as_ref().join(format!("{}.json", name));
    let mut config = RunConfig::from_file(&path)?;
    if config.name.is_none() {
        config.name = Some(name.to_string());
    }
    Ok(config)
}
