use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::time::Duration;
use tracing::debug;

/// Per-run accumulator owned by the orchestrator's send loop
///
/// `received` counts sends that produced a valid round-trip measurement.
/// Latencies are kept in observation order for the raw latency dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    pub sent: u64,
    pub received: u64,
    pub errors: Vec<String>,
    pub latencies_ms: Vec<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Record a delivered message with its round-trip latency
    pub fn record_delivery(&mut self, latency: Duration) {
        self.received += 1;
        self.latencies_ms.push(latency.as_nanos() as f64 / 1e6);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Merge receive-side counters reported by an adapter
    pub fn merge_received(&mut self, received: u64, latencies_ms: &[f64]) {
        self.received += received;
        self.latencies_ms.extend_from_slice(latencies_ms);
    }

    /// Saturating loss fraction in [0, 1]
    pub fn loss(&self) -> f64 {
        loss_fraction(self.sent, self.received)
    }

    pub fn latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_samples(&self.latencies_ms)
    }
}

/// `1 − received/max(sent, 1)`, clamped to [0, 1]
///
/// Duplicate delivery can report more receptions than sends; that case
/// saturates at zero loss instead of going negative.
pub fn loss_fraction(sent: u64, received: u64) -> f64 {
    let loss = 1.0 - received as f64 / sent.max(1) as f64;
    loss.clamp(0.0, 1.0)
}

/// Summary statistics over latency samples in milliseconds
///
/// Percentiles index into the sorted samples without interpolation:
/// p50 is `sorted[len / 2]`, p95 is `sorted[min(floor(len × 0.95), len − 1)]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl LatencyStats {
    /// `None` when there are no samples; zero is a valid latency
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let len = sorted.len();

        Some(Self {
            avg_ms: sorted.iter().sum::<f64>() / len as f64,
            min_ms: sorted[0],
            max_ms: sorted[len - 1],
            p50_ms: sorted[len / 2],
            p95_ms: sorted[((len as f64 * 0.95) as usize).min(len - 1)],
        })
    }
}

/// Receive log contents: one `<seq> <round_trip_us>` pair per line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecvLog {
    pub received: u64,
    pub latencies_ms: Vec<f64>,
    pub malformed_lines: usize,
}

impl RecvLog {
    /// Sent count when no independent figure exists: `max(received, 1)`
    pub fn estimated_sent(&self) -> u64 {
        self.received.max(1)
    }
}

/// Parse a passive-mode receive log
///
/// Round-trip times are converted from microseconds to milliseconds.
/// Blank lines are ignored; lines that do not hold two integers are counted
/// as malformed and skipped.
pub fn parse_recv_log<R: BufRead>(reader: R) -> std::io::Result<RecvLog> {
    let mut log = RecvLog::default();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let parsed = match (fields.next(), fields.next()) {
            (Some(seq), Some(rtt)) => seq
                .parse::<u64>()
                .ok()
                .and_then(|_| rtt.parse::<u64>().ok()),
            _ => None,
        };
        match parsed {
            Some(rtt_us) => {
                log.received += 1;
                log.latencies_ms.push(rtt_us as f64 / 1000.0);
            }
            None => {
                debug!("Skipping malformed receive log line: {:?}", trimmed);
                log.malformed_lines += 1;
            }
        }
    }
    Ok(log)
}
