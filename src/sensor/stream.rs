//! Lazy sensor reading stream
//!
//! `SensorStream` yields exactly `num_clients × packets_per_client` items in
//! round-robin device order unless its wall-clock safety timeout fires
//! first. Each item carries the interval the orchestrator should wait
//! before the next send.

use super::models::{weibull_interval, ClientState};
use super::{SensorKind, SensorReading};
use crate::config::RunConfig;
use crate::utils::duration_from_secs;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How the gap between consecutive readings is drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterArrival {
    /// Bursty traffic: `scale × (−ln U)^(1/shape)` seconds
    Weibull { shape: f64, scale: f64 },
    /// Constant `1/rate` spacing
    Fixed(Duration),
}

/// Parameters the stream needs, split out of `RunConfig`
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub num_clients: usize,
    pub packets_per_client: usize,
    pub sensors: Vec<SensorKind>,
    pub inter_arrival: InterArrival,
    /// Caps each interval when set
    pub max_interval: Option<Duration>,
    /// Safety bound on the wall-clock lifetime of the stream
    pub timeout: Duration,
    pub seed: Option<u64>,
}

impl StreamConfig {
    pub fn from_run_config(config: &RunConfig) -> Self {
        let inter_arrival = if config.use_weibull_iat {
            InterArrival::Weibull {
                shape: config.weibull_k,
                scale: config.weibull_scale,
            }
        } else {
            let rate = if config.rate > 0.0 { config.rate } else { 1.0 };
            InterArrival::Fixed(duration_from_secs(1.0 / rate))
        };
        Self {
            num_clients: config.num_clients,
            packets_per_client: config.packets_per_client,
            sensors: config.sensors.clone(),
            inter_arrival,
            max_interval: config.max_interval.map(duration_from_secs),
            timeout: config.duration(),
            seed: config.seed,
        }
    }

    /// Fixed-interval stream, mostly useful for tests and benchmarks
    pub fn fixed(num_clients: usize, packets_per_client: usize, interval: Duration) -> Self {
        Self {
            num_clients,
            packets_per_client,
            sensors: vec![SensorKind::Temperature],
            inter_arrival: InterArrival::Fixed(interval),
            max_interval: None,
            timeout: Duration::from_secs(3600),
            seed: None,
        }
    }

    pub fn total(&self) -> usize {
        self.num_clients * self.packets_per_client
    }
}

/// One element of the stream
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub client_id: String,
    pub reading: SensorReading,
    /// Wait before the next send
    pub interval: Duration,
}

struct Device {
    kind: SensorKind,
    device_id: String,
    client_id: String,
    state: ClientState,
}

/// Finite, non-restartable sequence of sensor readings
///
/// Reading timestamps follow the schedule clock: the wall-clock time of the
/// first `next()` call plus the intervals emitted so far. Under
/// drift-compensated pacing this is the intended send time of the reading.
/// The safety timeout runs from the same first call, so time spent between
/// building the stream and consuming it is not charged to either.
pub struct SensorStream {
    config: StreamConfig,
    devices: Vec<Device>,
    rng: StdRng,
    emitted: usize,
    sequence: u64,
    /// Monotonic and wall-clock anchors, set on the first `next()`
    clock: Option<(Instant, f64)>,
    schedule_offset: f64,
    finished: bool,
}

impl SensorStream {
    pub fn new(config: StreamConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sensors = if config.sensors.is_empty() {
            vec![SensorKind::Temperature]
        } else {
            config.sensors.clone()
        };
        let devices = (0..config.num_clients)
            .map(|i| {
                let kind = sensors[i % sensors.len()].clone();
                Device {
                    device_id: format!("{}_{}", kind, i),
                    client_id: format!("client_{}", i),
                    kind,
                    state: ClientState::new(&mut rng),
                }
            })
            .collect();

        debug!(
            "Sensor stream: {} devices x {} packets, {:?}",
            config.num_clients, config.packets_per_client, config.inter_arrival
        );

        Self {
            config,
            devices,
            rng,
            emitted: 0,
            sequence: 0,
            clock: None,
            schedule_offset: 0.0,
            finished: false,
        }
    }

    pub fn from_run_config(config: &RunConfig) -> Self {
        Self::new(StreamConfig::from_run_config(config))
    }

    /// Readings yielded so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn total(&self) -> usize {
        self.config.total()
    }

    fn next_interval(&mut self) -> Duration {
        let interval = match self.config.inter_arrival {
            InterArrival::Weibull { shape, scale } => {
                let secs = weibull_interval(&mut self.rng, shape, scale);
                // Extreme tails that no Duration can hold collapse to the
                // stream timeout, which ends the stream anyway.
                Duration::try_from_secs_f64(secs).unwrap_or(self.config.timeout)
            }
            InterArrival::Fixed(interval) => interval,
        };
        match self.config.max_interval {
            Some(max) => interval.min(max),
            None => interval,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        info!(
            "Sensor stream complete: {} messages in {:.1}s",
            self.emitted,
            self.clock
                .map_or(0.0, |(started_at, _)| started_at.elapsed().as_secs_f64())
        );
    }
}

impl Iterator for SensorStream {
    type Item = StreamItem;

    fn next(&mut self) -> Option<StreamItem> {
        if self.finished {
            return None;
        }
        if self.emitted >= self.config.total() || self.devices.is_empty() {
            self.finish();
            return None;
        }
        let (started_at, start_wall) = *self
            .clock
            .get_or_insert_with(|| (Instant::now(), crate::utils::unix_time_secs()));
        if started_at.elapsed() > self.config.timeout {
            warn!(
                "Sensor stream timed out after {:.1}s ({} of {} messages)",
                self.config.timeout.as_secs_f64(),
                self.emitted,
                self.config.total()
            );
            self.finish();
            return None;
        }

        let index = self.emitted % self.devices.len();
        self.sequence += 1;
        let now = self.schedule_offset;
        let interval = self.next_interval();

        let device = &mut self.devices[index];
        let payload = device.state.generate(&mut self.rng, &device.kind, now);
        let reading = SensorReading {
            device_id: device.device_id.clone(),
            client_id: device.client_id.clone(),
            timestamp: start_wall + now,
            sequence_number: self.sequence,
            payload,
            node_id: None,
        };
        let client_id = device.client_id.clone();

        self.emitted += 1;
        self.schedule_offset += interval.as_secs_f64();

        Some(StreamItem {
            client_id,
            reading,
            interval,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        (0, Some(self.config.total().saturating_sub(self.emitted)))
    }
}
