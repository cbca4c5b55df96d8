use crate::config::{Role, RunConfig, TransportMode};
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Derived, immutable snapshot of one run, persisted as `summary.json`
///
/// Latency fields are omitted entirely when no sample was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub protocol: String,
    pub mode: TransportMode,
    pub role: Role,
    pub node_id: String,
    pub node_ip: String,
    pub timestamp: String,
    pub sent: u64,
    pub recv: u64,
    pub loss: f64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_avg_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_min_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_max_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_p50_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_p95_ms: Option<f64>,
}

impl RunSummary {
    pub fn from_metrics(config: &RunConfig, metrics: &Metrics) -> Self {
        let stats = metrics.latency_stats();
        Self {
            protocol: config.protocol.clone(),
            mode: config.mode,
            role: config.effective_role(),
            node_id: config.node_id(),
            node_ip: crate::utils::hostname(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            sent: metrics.sent,
            recv: metrics.received,
            loss: metrics.loss(),
            errors: metrics.errors.len() as u64,
            lat_avg_ms: stats.map(|s| s.avg_ms),
            lat_min_ms: stats.map(|s| s.min_ms),
            lat_max_ms: stats.map(|s| s.max_ms),
            lat_p50_ms: stats.map(|s| s.p50_ms),
            lat_p95_ms: stats.map(|s| s.p95_ms),
        }
    }

    pub fn has_latency(&self) -> bool {
        self.lat_avg_ms.is_some()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read summary {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse summary {}", path.display()))
    }
}

/// Destination for finished runs
///
/// Constructed by the run driver and passed in, so tests can substitute an
/// in-memory sink.
pub trait ResultSink: Send + Sync {
    /// Persist one run; returns where it was written, if anywhere
    fn save_run(
        &self,
        scenario: &str,
        summary: &RunSummary,
        metrics: &Metrics,
    ) -> Result<Option<PathBuf>>;

    /// Persist an arbitrary JSON document next to the runs
    fn save_json(&self, _name: &str, _value: &serde_json::Value) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes `<root>/<protocol>_<scenario>_<unix_ts>/` with `summary.json`,
/// `latencies.txt` and, when errors occurred, `errors.txt`
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh run directory
    ///
    /// A second run of the same protocol and scenario within the same
    /// second gets a `_2`, `_3`, ... suffix instead of overwriting the first.
    fn claim_run_dir(&self, scenario: &str, summary: &RunSummary) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create results directory {}", self.root.display())
        })?;
        let base = format!(
            "{}_{}_{}",
            summary.protocol,
            scenario,
            chrono::Utc::now().timestamp()
        );
        let mut attempt = 1;
        loop {
            let name = if attempt == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            let dir = self.root.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create results directory {}", dir.display())
                    })
                }
            }
        }
    }
}

impl ResultSink for DirectorySink {
    fn save_run(
        &self,
        scenario: &str,
        summary: &RunSummary,
        metrics: &Metrics,
    ) -> Result<Option<PathBuf>> {
        let dir = self.claim_run_dir(scenario, summary)?;

        let summary_path = dir.join("summary.json");
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&summary_path, json)
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;

        write_lines(&dir.join("latencies.txt"), &metrics.latencies_ms)?;
        if !metrics.errors.is_empty() {
            write_lines(&dir.join("errors.txt"), &metrics.errors)?;
        }

        info!("Results saved to {}", dir.display());
        Ok(Some(dir))
    }

    fn save_json(&self, name: &str, value: &serde_json::Value) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create results directory {}", self.root.display())
        })?;
        let path = self.root.join(name);
        fs::write(&path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Wrote {}", path.display());
        Ok(Some(path))
    }
}

fn write_lines<T: std::fmt::Display>(path: &Path, lines: &[T]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metrics_with(latencies: &[f64], errors: &[&str]) -> Metrics {
        Metrics {
            sent: 4,
            received: latencies.len() as u64,
            errors: errors.iter().map(|e| e.to_string()).collect(),
            latencies_ms: latencies.to_vec(),
        }
    }

    #[test]
    fn test_summary_from_metrics() {
        let mut config = RunConfig::new("coap");
        config.role = Some(Role::Sensor);
        let summary = RunSummary::from_metrics(&config, &metrics_with(&[4.0, 2.0, 8.0], &[]));

        assert_eq!(summary.protocol, "coap");
        assert_eq!(summary.role, Role::Sensor);
        assert_eq!(summary.node_id, "sensor");
        assert_eq!(summary.sent, 4);
        assert_eq!(summary.recv, 3);
        assert_eq!(summary.loss, 0.25);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.lat_min_ms, Some(2.0));
        assert_eq!(summary.lat_max_ms, Some(8.0));
        assert_eq!(summary.lat_p50_ms, Some(4.0));
        assert_eq!(summary.timestamp.len(), "2024-01-01 00:00:00".len());
    }

    #[test]
    fn test_summary_omits_missing_latency() {
        let config = RunConfig::new("mqtt");
        let summary = RunSummary::from_metrics(&config, &metrics_with(&[], &["boom"]));
        assert!(!summary.has_latency());
        assert_eq!(summary.loss, 1.0);
        assert_eq!(summary.errors, 1);

        let value = serde_json::to_value(&summary).unwrap();
        for key in ["lat_avg_ms", "lat_min_ms", "lat_max_ms", "lat_p50_ms", "lat_p95_ms"] {
            assert!(value.get(key).is_none(), "{} should be absent", key);
        }
        for key in ["protocol", "mode", "role", "node_id", "node_ip", "timestamp", "sent", "recv", "loss", "errors"] {
            assert!(value.get(key).is_some(), "{} should be present", key);
        }
        assert_eq!(value["mode"], "active");
        assert_eq!(value["role"], "core");
    }

    #[test]
    fn test_summary_json_round_trip() {
        let config = RunConfig::new("coap");
        let summary =
            RunSummary::from_metrics(&config, &metrics_with(&[10.25, 0.5, 3.75], &["e"]));
        let json = serde_json::to_string(&summary).unwrap();
        let back: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn test_directory_sink_layout() {
        let dir = tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let config = RunConfig::new("coap");
        let metrics = metrics_with(&[1.5, 0.25], &["timeout"]);
        let summary = RunSummary::from_metrics(&config, &metrics);

        let run_dir = sink.save_run("baseline", &summary, &metrics).unwrap().unwrap();
        let name = run_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("coap_baseline_"), "{}", name);

        let reloaded = RunSummary::from_file(run_dir.join("summary.json")).unwrap();
        assert_eq!(reloaded, summary);
        assert_eq!(
            fs::read_to_string(run_dir.join("latencies.txt")).unwrap(),
            "1.5\n0.25\n"
        );
        assert_eq!(
            fs::read_to_string(run_dir.join("errors.txt")).unwrap(),
            "timeout\n"
        );
    }

    #[test]
    fn test_directory_sink_skips_empty_errors() {
        let dir = tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let config = RunConfig::new("mqtt");
        let metrics = metrics_with(&[], &[]);
        let summary = RunSummary::from_metrics(&config, &metrics);

        let run_dir = sink.save_run("adhoc", &summary, &metrics).unwrap().unwrap();
        assert!(run_dir.join("summary.json").exists());
        assert!(run_dir.join("latencies.txt").exists());
        assert!(!run_dir.join("errors.txt").exists());
    }

    #[test]
    fn test_back_to_back_runs_keep_separate_directories() {
        let dir = tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let config = RunConfig::new("coap");
        let first = metrics_with(&[1.0], &[]);
        let second = metrics_with(&[2.0, 3.0], &[]);

        let a = sink
            .save_run("baseline", &RunSummary::from_metrics(&config, &first), &first)
            .unwrap()
            .unwrap();
        let b = sink
            .save_run("baseline", &RunSummary::from_metrics(&config, &second), &second)
            .unwrap()
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(RunSummary::from_file(a.join("summary.json")).unwrap().recv, 1);
        assert_eq!(RunSummary::from_file(b.join("summary.json")).unwrap().recv, 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_save_json() {
        let dir = tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("nested"));
        let path = sink
            .save_json("comparison.json", &serde_json::json!({"ok": true}))
            .unwrap()
            .unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("\"ok\": true"));
    }
}
