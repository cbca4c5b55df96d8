//! # IoT Protocol Benchmark Library
//!
//! Drives pluggable IoT messaging protocol implementations (MQTT-like pub/sub,
//! CoAP-like request/response, custom UDP) through a uniform lifecycle while
//! feeding them a synthetic, physically-modelled sensor data stream, and
//! reduces each run to a comparable `summary.json`.
//!
//! ## Architecture Overview
//!
//! - `sensor`: lazy, finite sensor reading stream with per-device statistical
//!   models (Ornstein-Uhlenbeck temperature, PIR dwell/blocking, MEMS
//!   accelerometer noise, velocity-bounded GPS, Weibull inter-arrival times)
//! - `protocol`: the `ProtocolAdapter` trait, the adapter registry, and the
//!   reference adapters
//! - `orchestrator`: run lifecycle, drift-compensated pacing, metrics capture
//! - `comparator`: runs the orchestrator once per protocol and ranks results
//! - `metrics` / `results`: accumulation, summary statistics, persistence
//! - `network`: network impairment profiles applied around a run
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use iot_bench::{
//!     config::RunConfig, network::NoEmulation, orchestrator::run_single,
//!     protocol::AdapterRegistry, results::DirectorySink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::from_file("configs/scenarios/industrial.json")?;
//!     let registry = AdapterRegistry::with_defaults();
//!     let sink = DirectorySink::new("results");
//!     let summary = run_single(&config, &registry, &sink, &mut NoEmulation).await?;
//!     if let Some(summary) = summary {
//!         println!("sent={} recv={} loss={:.3}", summary.sent, summary.recv, summary.loss);
//!     }
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// Argument parsing with clap, including the protocol comparison and
/// use-case selection flags.
pub mod cli;

/// Protocol comparison across identical scenarios
pub mod comparator;

/// Run configuration, scenario loading and validation
pub mod config;

pub mod logging;

/// Metrics accumulation and summary statistics
///
/// Owns the per-run accumulator (sent, received, errors, latency samples)
/// and the sorted-index percentile rules used for `summary.json`. Also
/// parses the passive-mode receive log.
pub mod metrics;

/// Network impairment profiles and the `tc`/`netem` emulator
pub mod network;

/// Test orchestration engine
///
/// Contains the `Orchestrator` that takes one adapter through
/// server start, client start, paced sending and teardown, and the
/// `run_single` driver that wraps emulation and persistence around it.
pub mod orchestrator;

/// Protocol adapter abstraction and implementations
///
/// The `ProtocolAdapter` trait is the seam between the orchestrator and any
/// transport. Adapters are resolved once per run from the `AdapterRegistry`.
pub mod protocol;

/// Run summaries and result persistence
pub mod results;

/// Synthetic sensor traffic
pub mod sensor;

pub mod utils;

pub use comparator::{ComparisonReport, Comparator, UseCase};
pub use config::{RunConfig, TransportMode};
pub use metrics::Metrics;
pub use orchestrator::{run_single, Orchestrator};
pub use protocol::{AdapterRegistry, ProtocolAdapter, SendOutcome};
pub use results::{DirectorySink, ResultSink, RunSummary};
pub use sensor::{SensorKind, SensorReading, SensorStream};

/// The current version of the benchmark suite
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Timing constants here are shared by the orchestrator and the adapters so
/// every protocol sees identical startup and teardown budgets.
pub mod defaults {
    use std::time::Duration;

    /// Pause after `start_server` so the listener or broker can settle.
    pub const SERVER_SETTLE: Duration = Duration::from_millis(500);

    /// Pause after `start_clients` for connection establishment.
    pub const CLIENT_SETTLE: Duration = Duration::from_millis(500);

    /// Upper bound on waiting for a dependent server or broker to come up.
    pub const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(2);

    /// Poll interval while waiting for a server or broker.
    pub const SERVER_READY_POLL: Duration = Duration::from_millis(100);

    /// Upper bound on establishing all client contexts.
    pub const CLIENT_READY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default per-message send timeout, generous for impaired networks.
    pub const SEND_TIMEOUT_SECS: f64 = 30.0;

    /// Grace period between SIGTERM and SIGKILL for managed processes.
    pub const PROCESS_STOP_GRACE: Duration = Duration::from_secs(5);

    /// Default run duration in seconds.
    pub const DURATION_SECS: f64 = 30.0;

    /// Default number of packets each simulated client sends.
    pub const PACKETS_PER_CLIENT: usize = 50;

    /// Weibull inter-arrival shape (k < 1 gives bursty traffic).
    pub const WEIBULL_SHAPE: f64 = 0.8;

    /// Weibull inter-arrival scale in seconds.
    pub const WEIBULL_SCALE: f64 = 2.0;

    /// Upper bound on waiting for an adapter's receiver to catch up with
    /// unacknowledged sends at the end of an active run.
    pub const DELIVERY_DRAIN: Duration = Duration::from_secs(1);

    /// Pause between protocols in a comparison.
    pub const COMPARISON_SETTLE: Duration = Duration::from_millis(500);

    /// Default pub/sub topic.
    pub const TOPIC: &str = "iot-bench/sensors";

    /// Receive log written by external passive-mode servers.
    pub const RECV_LOG: &str = "recv.log";
}
