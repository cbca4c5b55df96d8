//! # Run Orchestration
//!
//! Drives one protocol adapter through a complete run:
//!
//! `Created → ServerStarted → ClientsStarted → Running(mode) → Stopped`
//!
//! ## Modes
//!
//! - **Active with clients**: readings are pulled from the stream one at a
//!   time and sent through `send_data`. Pacing is drift compensated: the
//!   k-th send is scheduled at `start + Σ intervals[..k]`, so per-message
//!   processing time never accumulates across the run.
//! - **Active, server-only**: no clients; the node listens for the run
//!   duration and takes receive counts from the adapter afterwards.
//! - **Passive**: external processes produce the traffic; after the run
//!   duration the receive log is parsed.
//!
//! ## Teardown
//!
//! `shutdown` stops the adapter exactly once and is called on every exit
//! path, including startup failures and interrupts. `run_interruptible`
//! wraps the whole lifecycle with network emulation and result persistence;
//! `run_single` does the same with Ctrl-C as the interrupt.

use crate::{
    config::{RunConfig, TransportMode},
    metrics::{parse_recv_log, Metrics},
    network::{NetworkEmulator, NetworkProfile},
    protocol::{AdapterRegistry, FaultInjector, ProtocolAdapter},
    results::{ResultSink, RunSummary},
    sensor::{SensorStream, StreamItem},
};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle position of an `Orchestrator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    ServerStarted,
    ClientsStarted,
    Running(TransportMode),
    Stopped,
}

/// Banner logged at the start of every run
struct RunConfigDisplay<'a> {
    config: &'a RunConfig,
    mode: TransportMode,
}

impl<'a> std::fmt::Display for RunConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting run for: {}", config.protocol)?;
        writeln!(f, "  Scenario:           {}", config.scenario_name())?;
        writeln!(f, "  Mode:               {}", self.mode)?;
        writeln!(f, "  Role:               {}", config.effective_role())?;
        writeln!(f, "  Node ID:            {}", config.node_id())?;
        writeln!(
            f,
            "  Server:             {}:{}",
            config.server_ip, config.server_port
        )?;
        writeln!(f, "  Clients:            {}", config.num_clients)?;
        writeln!(f, "  Packets per Client: {}", config.packets_per_client)?;
        writeln!(f, "  Duration:           {}s", config.duration)?;
        if config.use_weibull_iat {
            writeln!(
                f,
                "  Inter-arrival:      Weibull(k={}, scale={}s)",
                config.weibull_k, config.weibull_scale
            )?;
        } else {
            writeln!(f, "  Inter-arrival:      fixed {} msg/s", config.rate)?;
        }
        writeln!(
            f,
            "  Network Profile:    {}",
            config.network_profile.as_deref().unwrap_or("none")
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

pub struct Orchestrator {
    config: RunConfig,
    adapter: Box<dyn ProtocolAdapter>,
    metrics: Metrics,
    state: RunState,
    stopped: bool,
}

impl Orchestrator {
    /// Resolve the configured protocol through `registry`
    ///
    /// Construction failure is fatal for the run. When the configuration
    /// carries fault settings the adapter is wrapped in a `FaultInjector`.
    pub fn new(config: RunConfig, registry: &AdapterRegistry) -> Result<Self> {
        let adapter = registry
            .create(&config)
            .with_context(|| format!("Failed to load protocol '{}'", config.protocol))?;
        let adapter: Box<dyn ProtocolAdapter> = match config.faults.clone() {
            Some(faults) => {
                info!("Applying failure injection to protocol: {:?}", faults);
                Box::new(FaultInjector::new(adapter, faults))
            }
            None => adapter,
        };
        Ok(Self::with_adapter(config, adapter))
    }

    /// Drive an already constructed adapter
    pub fn with_adapter(config: RunConfig, adapter: Box<dyn ProtocolAdapter>) -> Self {
        Self {
            config,
            adapter,
            metrics: Metrics::new(),
            state: RunState::Created,
            stopped: false,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Passive when either the configuration or the adapter says so
    pub fn mode(&self) -> TransportMode {
        if self.config.mode == TransportMode::Passive
            || self.adapter.transport_mode() == TransportMode::Passive
        {
            TransportMode::Passive
        } else {
            TransportMode::Active
        }
    }

    /// Summary of the metrics gathered so far
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::from_metrics(&self.config, &self.metrics);
        summary.mode = self.mode();
        summary
    }

    /// Execute the run against `stream`
    ///
    /// Returns `Ok(true)` when the run completed, including runs cut short
    /// because the adapter died. Startup failures stop the adapter before
    /// the error is returned.
    pub async fn run_test<I>(&mut self, stream: I) -> Result<bool>
    where
        I: IntoIterator<Item = StreamItem>,
    {
        let mode = self.mode();
        info!(
            "\n{}",
            RunConfigDisplay {
                config: &self.config,
                mode,
            }
        );

        if let Err(e) = self.start().await {
            error!("Failed to start server/clients: {:#}", e);
            self.shutdown().await;
            return Err(e);
        }

        self.state = RunState::Running(mode);
        match mode {
            TransportMode::Passive => self.run_passive().await,
            TransportMode::Active if self.config.num_clients == 0 => {
                self.run_server_only().await;
                Ok(true)
            }
            TransportMode::Active => {
                self.run_active(stream).await;
                Ok(true)
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        self.adapter
            .start_server()
            .await
            .context("start_server failed")?;
        self.state = RunState::ServerStarted;
        sleep(crate::defaults::SERVER_SETTLE).await;

        let num_clients = self.config.num_clients;
        if num_clients > 0 {
            info!("Starting {} clients...", num_clients);
            self.adapter
                .start_clients(num_clients)
                .await
                .context("start_clients failed")?;
            self.state = RunState::ClientsStarted;
            sleep(crate::defaults::CLIENT_SETTLE).await;
        } else {
            info!("Server-only mode - no clients started");
        }
        Ok(())
    }

    /// Send loop with drift-compensated pacing
    async fn run_active<I>(&mut self, stream: I)
    where
        I: IntoIterator<Item = StreamItem>,
    {
        info!("Running in ACTIVE mode");
        let node_id = self.config.node_id();
        let started = Instant::now();
        let mut next_wake = started;
        let mut unacknowledged = 0u64;

        for item in stream {
            if !self.adapter.is_alive() {
                warn!(
                    "Protocol died mid-test after {} messages",
                    self.metrics.sent
                );
                break;
            }

            let StreamItem {
                client_id,
                mut reading,
                interval,
            } = item;
            reading.node_id = Some(node_id.clone());

            match reading.to_bytes() {
                Ok(payload) => {
                    let t0 = Instant::now();
                    match self.adapter.send_data(&client_id, &payload).await {
                        Ok(outcome) => match (outcome.delivered, outcome.completed_at) {
                            (true, Some(completed_at)) if completed_at > t0 => {
                                self.metrics.record_delivery(completed_at - t0);
                            }
                            (true, None) => unacknowledged += 1,
                            _ => {}
                        },
                        Err(e) => {
                            debug!("send_data for {} failed: {:#}", client_id, e);
                            self.metrics.record_error(format!("{:#}", e));
                        }
                    }
                }
                Err(e) => self
                    .metrics
                    .record_error(format!("failed to encode reading: {}", e)),
            }
            self.metrics.record_sent();

            // Anchor to the schedule, not to when this send finished. When
            // an iteration overruns, the deadline is already past and the
            // next send goes out immediately.
            next_wake = match next_wake.checked_add(interval) {
                Some(wake) => wake,
                None => {
                    warn!("Interval {:?} is beyond the clock range, ending send loop", interval);
                    break;
                }
            };
            sleep_until(next_wake).await;
        }

        if unacknowledged > 0 {
            self.collect_unacknowledged(unacknowledged).await;
        }

        info!(
            "Send loop finished: {} sent, {} acknowledged, {} errors in {:.2}s",
            self.metrics.sent,
            self.metrics.received,
            self.metrics.errors.len(),
            started.elapsed().as_secs_f64()
        );
    }

    /// Credit fire-and-forget sends with what the adapter's own receiver saw
    ///
    /// Waits up to `DELIVERY_DRAIN` for the receiver to catch up. The merged
    /// count never exceeds the number of unacknowledged sends.
    async fn collect_unacknowledged(&mut self, unacknowledged: u64) {
        let deadline = Instant::now() + crate::defaults::DELIVERY_DRAIN;
        loop {
            let Some(stats) = self.adapter.delivery_stats() else {
                debug!(
                    "{} has no receive counters; {} unacknowledged sends stay uncounted",
                    self.adapter.name(),
                    unacknowledged
                );
                return;
            };
            if stats.received >= unacknowledged || Instant::now() >= deadline {
                let counted = stats.received.min(unacknowledged);
                let samples = stats.latencies_ms.len().min(counted as usize);
                self.metrics
                    .merge_received(counted, &stats.latencies_ms[..samples]);
                info!(
                    "Receiver confirmed {} of {} unacknowledged sends",
                    counted, unacknowledged
                );
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn run_server_only(&mut self) {
        info!("Server-only mode - listening for incoming data");
        info!("Listening for {} seconds...", self.config.duration);
        sleep(self.config.duration()).await;

        if let Some(stats) = self.adapter.delivery_stats() {
            info!("Adapter reported {} received messages", stats.received);
            self.metrics
                .merge_received(stats.received, &stats.latencies_ms);
        }
    }

    async fn run_passive(&mut self) -> Result<bool> {
        info!("Running in PASSIVE mode for {}s", self.config.duration);
        sleep(self.config.duration()).await;

        let path = &self.config.recv_log;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} not found - no latency data", path.display());
                return Ok(true);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()))
            }
        };

        let log = parse_recv_log(BufReader::new(file))
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if log.malformed_lines > 0 {
            warn!(
                "Skipped {} malformed lines in {}",
                log.malformed_lines,
                path.display()
            );
        }
        self.metrics.sent = log.estimated_sent();
        self.metrics.merge_received(log.received, &log.latencies_ms);
        info!("Parsed {} packets from {}", log.received, path.display());
        Ok(true)
    }

    /// Stop the adapter once; later calls do nothing
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.adapter.stop().await {
            warn!("Error while stopping {}: {:#}", self.adapter.name(), e);
        }
        self.state = RunState::Stopped;
        debug!("{} stopped", self.adapter.name());
    }
}

/// Shared interrupt flag
///
/// Clones observe the same trigger, so one Ctrl-C reaches every run that
/// holds a clone, including runs started after the signal arrived.
#[derive(Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    /// Flag that only fires through `trigger`
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flag fired by the first Ctrl-C; needs a running tokio runtime
    pub fn on_ctrl_c() -> Self {
        let interrupt = Self::new();
        let handle = interrupt.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted by user");
                    handle.trigger();
                }
                Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
            }
        });
        interrupt
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag has been triggered
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Cannot happen while `self` holds the sender
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What `run_interruptible` produced
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Persisted summary, absent when nothing was sent
    pub summary: Option<RunSummary>,
    /// The run was cut short by `Interrupt`
    pub interrupted: bool,
}

/// Run one configuration end to end, stopping on Ctrl-C
///
/// Returns `Ok(None)` when there was nothing to report.
pub async fn run_single(
    config: &RunConfig,
    registry: &AdapterRegistry,
    sink: &dyn ResultSink,
    emulator: &mut dyn NetworkEmulator,
) -> Result<Option<RunSummary>> {
    let interrupt = Interrupt::on_ctrl_c();
    let outcome = run_interruptible(config, registry, sink, emulator, &interrupt).await?;
    Ok(outcome.summary)
}

/// Run one configuration end to end
///
/// Applies the configured network profile, executes the run (racing it
/// against `interrupt`), always tears down the adapter and the emulation,
/// and persists the summary when the run succeeded or sent anything. An
/// interrupted run goes through the same teardown and still saves what it
/// sent.
pub async fn run_interruptible(
    config: &RunConfig,
    registry: &AdapterRegistry,
    sink: &dyn ResultSink,
    emulator: &mut dyn NetworkEmulator,
    interrupt: &Interrupt,
) -> Result<RunOutcome> {
    let mut orchestrator = Orchestrator::new(config.clone(), registry)?;

    if let Some(name) = &config.network_profile {
        info!("Applying network profile: {}", name);
        match NetworkProfile::resolve(name) {
            Ok(profile) => {
                if let Err(e) = emulator.apply(&profile).await {
                    error!("Failed to apply network profile '{}': {:#}", name, e);
                }
            }
            Err(e) => error!("{:#}", e),
        }
    }

    let stream = SensorStream::from_run_config(config);
    let mut interrupted = false;
    let ok = tokio::select! {
        result = orchestrator.run_test(stream) => match result {
            Ok(ok) => ok,
            Err(e) => {
                error!("Test failed: {:#}", e);
                false
            }
        },
        _ = interrupt.triggered() => {
            warn!("Test interrupted by user");
            interrupted = true;
            false
        }
    };

    info!("Cleaning up test...");
    orchestrator.shutdown().await;
    emulator.clear().await;

    if !ok && orchestrator.metrics().sent == 0 {
        error!("Test failed - no results saved");
        return Ok(RunOutcome {
            summary: None,
            interrupted,
        });
    }

    let summary = orchestrator.summary();
    if let Some(dir) = sink.save_run(config.scenario_name(), &summary, orchestrator.metrics())? {
        info!("Report saved to {}/", dir.display());
    }
    info!(
        "  Sent: {}, Recv: {}, Loss: {:.2}%",
        summary.sent,
        summary.recv,
        summary.loss * 100.0
    );
    if let (Some(avg), Some(p50)) = (summary.lat_avg_ms, summary.lat_p50_ms) {
        info!("  Latency: avg={:.2}ms, p50={:.2}ms", avg, p50);
    }
    Ok(RunOutcome {
        summary: Some(summary),
        interrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeliveryStats, SendOutcome};
    use crate::sensor::StreamConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Shared view into what a `Scripted` adapter saw
    #[derive(Default)]
    struct Observed {
        send_times: Vec<Instant>,
        send_walls: Vec<f64>,
        payloads: Vec<serde_json::Value>,
        stops: usize,
    }

    struct Scripted {
        seen: Arc<Mutex<Observed>>,
        processing: Duration,
        delivered: bool,
        acknowledge: bool,
        fail_server: bool,
        alive_for: Option<usize>,
        passive: bool,
        received: Option<u64>,
    }

    impl Scripted {
        fn new(seen: Arc<Mutex<Observed>>) -> Self {
            Self {
                seen,
                processing: Duration::ZERO,
                delivered: true,
                acknowledge: true,
                fail_server: false,
                alive_for: None,
                passive: false,
                received: None,
            }
        }
    }

    #[async_trait]
    impl ProtocolAdapter for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start_server(&mut self) -> Result<()> {
            if self.fail_server {
                anyhow::bail!("bind refused");
            }
            Ok(())
        }

        async fn start_clients(&mut self, _count: usize) -> Result<()> {
            Ok(())
        }

        async fn send_data(&mut self, _client_id: &str, payload: &[u8]) -> Result<SendOutcome> {
            {
                let mut seen = self.seen.lock();
                seen.send_times.push(Instant::now());
                seen.send_walls.push(crate::utils::unix_time_secs());
                seen.payloads.push(serde_json::from_slice(payload)?);
            }
            if !self.processing.is_zero() {
                sleep(self.processing).await;
            }
            if self.delivered && self.acknowledge {
                Ok(SendOutcome::acknowledged(Instant::now()))
            } else if self.delivered {
                Ok(SendOutcome::unacknowledged())
            } else {
                Ok(SendOutcome::failed())
            }
        }

        async fn stop(&mut self) -> Result<()> {
            self.seen.lock().stops += 1;
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive_for
                .map_or(true, |n| self.seen.lock().send_times.len() < n)
        }

        fn delivery_stats(&self) -> Option<DeliveryStats> {
            self.received.map(|received| DeliveryStats {
                received,
                latencies_ms: vec![1.0; received as usize],
            })
        }

        fn transport_mode(&self) -> TransportMode {
            if self.passive {
                TransportMode::Passive
            } else {
                TransportMode::Active
            }
        }
    }

    fn active_config(num_clients: usize, packets: usize) -> RunConfig {
        let mut config = RunConfig::new("scripted");
        config.num_clients = num_clients;
        config.packets_per_client = packets;
        config.node_id = Some("node-a".to_string());
        config
    }

    fn fixed_stream(num_clients: usize, packets: usize, interval: Duration) -> SensorStream {
        let mut stream = StreamConfig::fixed(num_clients, packets, interval);
        stream.seed = Some(3);
        SensorStream::new(stream)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_compensated_schedule() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.processing = Duration::from_millis(7);

        let intervals: Vec<Duration> = [50, 10, 120, 30, 80, 15, 200, 40]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        let stream: Vec<StreamItem> = fixed_stream(2, 4, Duration::ZERO)
            .zip(intervals.iter())
            .map(|(mut item, interval)| {
                item.interval = *interval;
                item
            })
            .collect();

        let mut orchestrator = Orchestrator::with_adapter(active_config(2, 4), Box::new(adapter));
        assert!(orchestrator.run_test(stream).await.unwrap());

        let times = seen.lock().send_times.clone();
        assert_eq!(times.len(), 8);
        let mut scheduled = Duration::ZERO;
        for (k, at) in times.iter().enumerate() {
            assert_eq!(*at - times[0], scheduled, "send {} drifted", k);
            scheduled += intervals[k];
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_does_not_skip_or_accumulate() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        // Processing takes longer than the interval
        adapter.processing = Duration::from_millis(30);

        let mut orchestrator = Orchestrator::with_adapter(active_config(1, 10), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(1, 10, Duration::from_millis(10)))
            .await
            .unwrap();

        let times = seen.lock().send_times.clone();
        assert_eq!(times.len(), 10);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(30));
        }
        assert_eq!(orchestrator.metrics().sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_acknowledged() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.processing = Duration::from_millis(10);

        let mut orchestrator =
            Orchestrator::with_adapter(active_config(10, 20), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(10, 20, Duration::from_millis(20)))
            .await
            .unwrap();

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.sent, 200);
        assert_eq!(metrics.received, 200);
        assert_eq!(metrics.latencies_ms.len(), 200);
        assert!(metrics.latencies_ms.iter().all(|l| (*l - 10.0).abs() < 1e-6));

        let summary = orchestrator.summary();
        assert_eq!(summary.loss, 0.0);
        assert_eq!(summary.lat_p95_ms, Some(10.0));

        let seen = seen.lock();
        assert!(seen
            .payloads
            .iter()
            .all(|p| p["node_id"] == "node-a"));
        let seqs: Vec<u64> = seen
            .payloads
            .iter()
            .map(|p| p["seq_no"].as_u64().unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_acknowledged() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen);
        adapter.delivered = false;

        let mut orchestrator =
            Orchestrator::with_adapter(active_config(10, 20), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(10, 20, Duration::from_millis(5)))
            .await
            .unwrap();

        let summary = orchestrator.summary();
        assert_eq!(summary.sent, 200);
        assert_eq!(summary.recv, 0);
        assert_eq!(summary.loss, 1.0);
        assert_eq!(summary.errors, 0);
        assert!(!summary.has_latency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_sends_use_receiver_counts() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen);
        adapter.acknowledge = false;
        adapter.received = Some(8);

        let mut orchestrator = Orchestrator::with_adapter(active_config(2, 5), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(2, 5, Duration::from_millis(5)))
            .await
            .unwrap();

        // Waits out the drain for the two missing arrivals, then counts 8
        let summary = orchestrator.summary();
        assert_eq!(summary.sent, 10);
        assert_eq!(summary.recv, 8);
        assert!((summary.loss - 0.2).abs() < 1e-9);
        assert_eq!(orchestrator.metrics().latencies_ms.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_counts_capped_at_unacknowledged_sends() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen);
        adapter.acknowledge = false;
        adapter.received = Some(25);

        let mut orchestrator = Orchestrator::with_adapter(active_config(2, 5), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(2, 5, Duration::from_millis(5)))
            .await
            .unwrap();

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.sent, 10);
        assert_eq!(metrics.received, 10);
        assert_eq!(metrics.latencies_ms.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_without_receiver_counts() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen);
        adapter.acknowledge = false;

        let mut orchestrator = Orchestrator::with_adapter(active_config(2, 5), Box::new(adapter));
        orchestrator
            .run_test(fixed_stream(2, 5, Duration::from_millis(5)))
            .await
            .unwrap();

        assert_eq!(orchestrator.metrics().sent, 10);
        assert_eq!(orchestrator.metrics().received, 0);
    }

    #[tokio::test]
    async fn test_reading_timestamps_match_send_time() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let adapter = Scripted::new(seen.clone());

        // Built before the server and client settles, as run_single does
        let stream = fixed_stream(1, 3, Duration::from_millis(20));
        let mut orchestrator = Orchestrator::with_adapter(active_config(1, 3), Box::new(adapter));
        orchestrator.run_test(stream).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.payloads.len(), 3);
        for (payload, sent_at) in seen.payloads.iter().zip(seen.send_walls.iter()) {
            let ts = payload["ts"].as_f64().unwrap();
            assert!((sent_at - ts).abs() < 0.25, "ts {} vs send {}", ts, sent_at);
        }
    }

    #[tokio::test]
    async fn test_interrupt_reaches_every_clone() {
        let interrupt = Interrupt::new();
        let waiter = interrupt.clone();
        assert!(!waiter.is_triggered());

        let pending = tokio::spawn(async move { waiter.triggered().await });
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();

        // Clones taken after the trigger resolve immediately
        let late = interrupt.clone();
        assert!(late.is_triggered());
        late.triggered().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_adapter_dies() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.alive_for = Some(5);

        let mut orchestrator =
            Orchestrator::with_adapter(active_config(10, 20), Box::new(adapter));
        assert!(orchestrator
            .run_test(fixed_stream(10, 20, Duration::from_millis(5)))
            .await
            .unwrap());
        assert_eq!(orchestrator.metrics().sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_failure_still_stops_once() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.fail_server = true;

        let mut orchestrator = Orchestrator::with_adapter(active_config(2, 2), Box::new(adapter));
        assert!(orchestrator
            .run_test(fixed_stream(2, 2, Duration::from_millis(5)))
            .await
            .is_err());
        assert_eq!(orchestrator.state(), RunState::Stopped);

        orchestrator.shutdown().await;
        assert_eq!(seen.lock().stops, 1);
        assert!(seen.lock().send_times.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_only_merges_adapter_counts() {
        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.received = Some(4);

        let mut config = active_config(0, 20);
        config.duration = 3.0;
        let mut orchestrator = Orchestrator::with_adapter(config, Box::new(adapter));

        let started = Instant::now();
        assert!(orchestrator.run_test(Vec::<StreamItem>::new()).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(orchestrator.metrics().received, 4);
        assert_eq!(orchestrator.metrics().latencies_ms.len(), 4);
        assert!(seen.lock().send_times.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_parses_receive_log() {
        let dir = tempdir().unwrap();
        let mut config = active_config(2, 5);
        config.duration = 1.0;
        config.recv_log = dir.path().join("recv.log");
        std::fs::write(&config.recv_log, "1 1500\n2 2500\nbad line\n3 500\n").unwrap();

        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut adapter = Scripted::new(seen.clone());
        adapter.passive = true;

        let mut orchestrator = Orchestrator::with_adapter(config, Box::new(adapter));
        assert_eq!(orchestrator.mode(), TransportMode::Passive);
        assert!(orchestrator
            .run_test(fixed_stream(2, 5, Duration::from_millis(5)))
            .await
            .unwrap());

        let summary = orchestrator.summary();
        assert_eq!(summary.mode, TransportMode::Passive);
        assert_eq!(summary.recv, 3);
        assert_eq!(summary.sent, 3);
        assert_eq!(orchestrator.metrics().latencies_ms, vec![1.5, 2.5, 0.5]);
        assert!(seen.lock().send_times.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_without_log() {
        let dir = tempdir().unwrap();
        let mut config = active_config(1, 1);
        config.mode = TransportMode::Passive;
        config.duration = 0.5;
        config.recv_log = dir.path().join("recv.log");

        let seen = Arc::new(Mutex::new(Observed::default()));
        let mut orchestrator =
            Orchestrator::with_adapter(config, Box::new(Scripted::new(seen)));
        assert!(orchestrator.run_test(Vec::<StreamItem>::new()).await.unwrap());
        assert_eq!(orchestrator.metrics().sent, 0);
        assert!(!orchestrator.summary().has_latency());
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_fatal() {
        let registry = AdapterRegistry::with_defaults();
        assert!(Orchestrator::new(RunConfig::new("zigbee"), &registry).is_err());
    }
}
