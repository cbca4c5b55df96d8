//! # Protocol Comparison
//!
//! Runs the full orchestrator lifecycle once per protocol against the same
//! scenario. Only the protocol name and its natural port differ between
//! runs. Runs are strictly sequential: the protocols share the loopback
//! address space and, when a network profile is set, the host-wide
//! emulation rules.
//!
//! A protocol whose run produced no summary is listed in
//! `ComparisonReport::missing` rather than reported with zeroes, so "ran and
//! delivered nothing" stays distinguishable from "did not run". An
//! interrupt ends the comparison after the current run's teardown; the
//! protocols that never started are listed as missing and the partial
//! report is still saved.

use crate::{
    config::RunConfig,
    network::NetworkEmulator,
    orchestrator::{run_interruptible, Interrupt},
    protocol::AdapterRegistry,
    results::{ResultSink, RunSummary},
    utils::{format_latency_ms, table_row, table_separator},
};
use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Protocols compared when none are named
pub const DEFAULT_PROTOCOLS: [&str; 3] = ["mqtt", "coap", "my_udp"];

/// A protocol is flagged when it sent less than this share of the
/// expected message count
pub const FAIRNESS_TOLERANCE: f64 = 0.5;

/// Natural port of a known protocol
pub fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        "mqtt" => Some(1883),
        "coap" => Some(5683),
        "my_udp" => Some(5000),
        "srtp" => Some(5004),
        _ => None,
    }
}

/// Weighting used to pick a recommended protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    /// Reliability first
    #[clap(name = "critical_data")]
    CriticalData,
    /// Tail latency first
    #[clap(name = "real_time")]
    RealTime,
    /// Message volume first
    #[clap(name = "high_throughput")]
    HighThroughput,
    #[default]
    #[clap(name = "balanced")]
    Balanced,
}

impl std::fmt::Display for UseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UseCase::CriticalData => "critical_data",
            UseCase::RealTime => "real_time",
            UseCase::HighThroughput => "high_throughput",
            UseCase::Balanced => "balanced",
        };
        write!(f, "{}", name)
    }
}

impl UseCase {
    /// Higher is better. Missing latency fields count as 0 ms.
    pub fn score(&self, summary: &RunSummary) -> f64 {
        let loss_pct = summary.loss * 100.0;
        let lat_avg = summary.lat_avg_ms.unwrap_or(0.0);
        let lat_p95 = summary.lat_p95_ms.unwrap_or(0.0);
        match self {
            UseCase::CriticalData => 100.0 - loss_pct * 10.0 - lat_avg * 0.1,
            UseCase::RealTime => 100.0 - lat_p95 * 2.0 - loss_pct * 0.5,
            UseCase::HighThroughput => summary.sent as f64 / 1000.0 - lat_avg * 0.1,
            UseCase::Balanced => 100.0 - loss_pct * 2.0 - lat_avg * 0.5,
        }
    }

    /// Best-scoring protocol among `results`, ties going to the first name
    pub fn recommend(&self, results: &BTreeMap<String, RunSummary>) -> Option<(String, f64)> {
        results
            .iter()
            .map(|(protocol, summary)| (protocol.clone(), self.score(summary)))
            .fold(None, |best, candidate| match best {
                Some((_, score)) if score >= candidate.1 => best,
                _ => Some(candidate),
            })
    }
}

/// Outcome of one comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub id: String,
    pub scenario: String,
    pub protocols: Vec<String>,
    pub results: BTreeMap<String, RunSummary>,
    /// Protocols that produced no summary
    pub missing: Vec<String>,
    pub use_case: UseCase,
    pub recommended: Option<String>,
    /// Protocols that sent under half the expected messages
    #[serde(default)]
    pub underfilled: Vec<String>,
    /// The comparison was stopped by an interrupt
    #[serde(default)]
    pub interrupted: bool,
}

impl ComparisonReport {
    pub fn new(scenario: &str, protocols: &[String], use_case: UseCase) -> Self {
        Self {
            id: crate::utils::generate_run_id(),
            scenario: scenario.to_string(),
            protocols: protocols.to_vec(),
            results: BTreeMap::new(),
            missing: Vec::new(),
            use_case,
            recommended: None,
            underfilled: Vec::new(),
            interrupted: false,
        }
    }

    /// Protocols whose `sent` fell below half of `expected`
    pub fn fairness_check(&self, expected: usize) -> Vec<String> {
        if expected == 0 {
            return Vec::new();
        }
        let floor = expected as f64 * (1.0 - FAIRNESS_TOLERANCE);
        self.results
            .iter()
            .filter(|(_, summary)| (summary.sent as f64) < floor)
            .map(|(protocol, _)| protocol.clone())
            .collect()
    }

    /// Fixed-width text table, one row per requested protocol
    pub fn render_table(&self) -> String {
        let widths = [10, 8, 8, 8, 7, 10, 10, 10];
        let mut lines = vec![
            table_separator(&widths),
            table_row(
                &["Protocol", "Sent", "Recv", "Loss %", "Errors", "Avg", "P50", "P95"],
                &widths,
            ),
            table_separator(&widths),
        ];
        for protocol in &self.protocols {
            let row = match self.results.get(protocol) {
                Some(s) => vec![
                    protocol.clone(),
                    s.sent.to_string(),
                    s.recv.to_string(),
                    format!("{:.2}", s.loss * 100.0),
                    s.errors.to_string(),
                    format_latency_ms(s.lat_avg_ms),
                    format_latency_ms(s.lat_p50_ms),
                    format_latency_ms(s.lat_p95_ms),
                ],
                None => {
                    let mut row = vec![protocol.clone(), "did not run".to_string()];
                    row.resize(widths.len(), String::new());
                    row
                }
            };
            let columns: Vec<&str> = row.iter().map(String::as_str).collect();
            lines.push(table_row(&columns, &widths));
        }
        lines.push(table_separator(&widths));
        if self.interrupted {
            lines.push("Interrupted: results are partial".to_string());
        }
        if let Some(best) = &self.recommended {
            lines.push(format!("Recommended for {}: {}", self.use_case, best));
        }
        lines.join("\n")
    }
}

/// Sequential multi-protocol runner
pub struct Comparator<'a> {
    registry: &'a AdapterRegistry,
    sink: &'a dyn ResultSink,
    use_case: UseCase,
    settle: Duration,
    natural_ports: bool,
    interrupt: Option<Interrupt>,
}

impl<'a> Comparator<'a> {
    pub fn new(registry: &'a AdapterRegistry, sink: &'a dyn ResultSink) -> Self {
        Self {
            registry,
            sink,
            use_case: UseCase::default(),
            settle: crate::defaults::COMPARISON_SETTLE,
            natural_ports: true,
            interrupt: None,
        }
    }

    pub fn with_use_case(mut self, use_case: UseCase) -> Self {
        self.use_case = use_case;
        self
    }

    /// Pause between protocol runs
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Stop on `interrupt` instead of Ctrl-C
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Keep the scenario's port for every protocol
    pub fn keep_scenario_port(mut self) -> Self {
        self.natural_ports = false;
        self
    }

    /// Configuration for one protocol's run
    pub fn config_for(&self, base: &RunConfig, protocol: &str) -> RunConfig {
        let mut config = base.clone();
        config.protocol = protocol.to_string();
        if self.natural_ports {
            if let Some(port) = default_port(protocol) {
                config.server_port = port;
            }
        }
        config
    }

    /// Run every protocol in order and persist the report
    pub async fn run(
        &self,
        base: &RunConfig,
        protocols: &[String],
        emulator: &mut dyn NetworkEmulator,
    ) -> Result<ComparisonReport> {
        let mut report = ComparisonReport::new(base.scenario_name(), protocols, self.use_case);
        info!("Comparing protocols: {}", protocols.join(", "));

        let interrupt = self.interrupt.clone().unwrap_or_else(Interrupt::on_ctrl_c);
        for (i, protocol) in protocols.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = sleep(self.settle) => {}
                    _ = interrupt.triggered() => {}
                }
            }
            if interrupt.is_triggered() {
                let skipped = &protocols[i..];
                warn!("Comparison interrupted, skipping {}", skipped.join(", "));
                report.interrupted = true;
                report.missing.extend(skipped.iter().cloned());
                break;
            }
            info!("=== Comparison run {}/{}: {} ===", i + 1, protocols.len(), protocol);

            let config = self.config_for(base, protocol);
            match run_interruptible(&config, self.registry, self.sink, emulator, &interrupt).await {
                Ok(outcome) => {
                    match outcome.summary {
                        Some(summary) => {
                            report.results.insert(protocol.clone(), summary);
                        }
                        None => {
                            warn!("{} produced no summary", protocol);
                            report.missing.push(protocol.clone());
                        }
                    }
                    if outcome.interrupted {
                        report.interrupted = true;
                    }
                }
                Err(e) => {
                    error!("{} failed: {:#}", protocol, e);
                    report.missing.push(protocol.clone());
                }
            }
        }

        report.underfilled = report.fairness_check(base.expected_packets());
        for protocol in &report.underfilled {
            let sent = report.results.get(protocol).map_or(0, |s| s.sent);
            warn!(
                "{} sent {}, expected ~{}; comparison might be invalid",
                protocol,
                sent,
                base.expected_packets()
            );
        }

        if let Some((best, score)) = self.use_case.recommend(&report.results) {
            info!("Best protocol for {}: {} (score {:.2})", self.use_case, best, score);
            report.recommended = Some(best);
        }

        info!("\n{}", report.render_table());
        let value = serde_json::to_value(&report)?;
        if let Some(path) = self.sink.save_json("comparison.json", &value)? {
            info!("Comparison saved to {}", path.display());
        }
        Ok(report)
    }
}
