use anyhow::Result;
use iot_bench::{
    config::{RunConfig, TransportMode},
    network::NoEmulation,
    orchestrator::run_single,
    protocol::AdapterRegistry,
    results::{DirectorySink, RunSummary},
};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Short fixed-rate run against an ephemeral port
fn loopback_config(protocol: &str) -> RunConfig {
    let mut config = RunConfig::new(protocol);
    config.name = Some("loopback".to_string());
    config.server_port = 0;
    config.num_clients = 3;
    config.packets_per_client = 5;
    config.use_weibull_iat = false;
    config.rate = 50.0;
    config.duration = 10.0;
    config.send_timeout = 2.0;
    config.seed = Some(7);
    config
}

fn run_dirs(root: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn assert_clean_round_trip(protocol: &str) -> Result<()> {
    let dir = tempdir()?;
    let sink = DirectorySink::new(dir.path());
    let registry = AdapterRegistry::with_defaults();
    let config = loopback_config(protocol);

    let summary = run_single(&config, &registry, &sink, &mut NoEmulation)
        .await?
        .expect("run should produce a summary");

    assert_eq!(summary.protocol, protocol);
    assert_eq!(summary.mode, TransportMode::Active);
    assert_eq!(summary.sent, 15);
    assert_eq!(summary.recv, 15);
    assert_eq!(summary.loss, 0.0);
    assert_eq!(summary.errors, 0);
    assert!(summary.has_latency());
    assert!(summary.lat_min_ms <= summary.lat_p50_ms);
    assert!(summary.lat_p50_ms <= summary.lat_p95_ms);

    let dirs = run_dirs(dir.path());
    assert_eq!(dirs.len(), 1);
    let name = dirs[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with(&format!("{}_loopback_", protocol)), "{}", name);

    assert_eq!(RunSummary::from_file(dirs[0].join("summary.json"))?, summary);
    let latencies = std::fs::read_to_string(dirs[0].join("latencies.txt"))?;
    assert_eq!(latencies.lines().count(), 15);
    assert!(!dirs[0].join("errors.txt").exists());
    Ok(())
}

#[tokio::test]
async fn coap_round_trip_over_loopback() -> Result<()> {
    assert_clean_round_trip("coap").await
}

#[tokio::test]
async fn mqtt_round_trip_over_loopback() -> Result<()> {
    assert_clean_round_trip("mqtt").await
}

#[tokio::test]
async fn mqtt_qos0_counts_subscriber_arrivals() -> Result<()> {
    let dir = tempdir()?;
    let sink = DirectorySink::new(dir.path());
    let registry = AdapterRegistry::with_defaults();
    let mut config = loopback_config("mqtt");
    config.qos = 0;
    config.num_clients = 2;

    let summary = run_single(&config, &registry, &sink, &mut NoEmulation)
        .await?
        .expect("run should produce a summary");

    assert_eq!(summary.sent, 10);
    assert_eq!(summary.recv, 10);
    assert_eq!(summary.loss, 0.0);
    assert!(summary.has_latency());
    Ok(())
}

#[tokio::test]
async fn unknown_protocol_fails_before_running() {
    let dir = tempdir().unwrap();
    let sink = DirectorySink::new(dir.path());
    let registry = AdapterRegistry::with_defaults();

    let result = run_single(&loopback_config("zigbee"), &registry, &sink, &mut NoEmulation).await;
    assert!(result.is_err());
    assert!(run_dirs(dir.path()).is_empty());
}

#[tokio::test]
async fn bind_failure_leaves_no_summary() -> Result<()> {
    // Hold the port so the responder cannot bind it
    let holder = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let mut config = loopback_config("coap");
    config.server_port = holder.local_addr()?.port();

    let dir = tempdir()?;
    let sink = DirectorySink::new(dir.path());
    let registry = AdapterRegistry::with_defaults();

    let summary = run_single(&config, &registry, &sink, &mut NoEmulation).await?;
    assert!(summary.is_none());
    assert!(run_dirs(dir.path()).is_empty());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn passive_run_reads_receive_log() -> Result<()> {
    let dir = tempdir()?;
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work)?;

    let mut config = loopback_config("my_udp");
    config.duration = 1.0;
    config.num_clients = 2;
    config.recv_log = work.join("recv.log");
    config.passive.server_command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "printf '1 1200\\n2 800\\n3 2000\\n' > recv.log; sleep 30".to_string(),
    ];
    config.passive.client_command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "sleep 30".to_string(),
    ];

    let results = dir.path().join("results");
    let sink = DirectorySink::new(&results);
    let registry = AdapterRegistry::with_defaults();

    let summary = run_single(&config, &registry, &sink, &mut NoEmulation)
        .await?
        .expect("passive run should produce a summary");

    assert_eq!(summary.mode, TransportMode::Passive);
    assert_eq!(summary.recv, 3);
    assert_eq!(summary.sent, 3);
    assert_eq!(summary.lat_min_ms, Some(0.8));
    assert_eq!(summary.lat_max_ms, Some(2.0));
    assert_eq!(summary.lat_p50_ms, Some(1.2));
    assert_eq!(run_dirs(&results).len(), 1);
    Ok(())
}
