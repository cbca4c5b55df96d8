//! Network impairment around a run
//!
//! A profile describes delay, jitter, loss and a bandwidth cap. `TcNetem`
//! applies it to one interface with `tc qdisc ... netem`; the interface is a
//! host-wide resource, so only one profile is active at a time and callers
//! run protocols sequentially while it is applied.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Directory profile names resolve against
pub const PROFILE_DIR: &str = "configs/network_conditions";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latency_ms: u32,
    #[serde(default)]
    pub jitter_ms: u32,
    #[serde(default)]
    pub loss_percent: f64,
    #[serde(default)]
    pub bandwidth_kbps: u32,
}

impl NetworkProfile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read network profile {}", path.display()))?;
        let mut profile: NetworkProfile = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse network profile {}", path.display()))?;
        if profile.name.is_empty() {
            profile.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(profile)
    }

    /// Load `<dir>/<name>.json`
    pub fn resolve_in(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        Self::from_file(profile_path(dir, name))
    }

    /// Load a profile by name from `configs/network_conditions/`
    pub fn resolve(name: &str) -> Result<Self> {
        Self::resolve_in(PROFILE_DIR, name)
    }

    /// True when applying the profile would change nothing
    pub fn is_unimpaired(&self) -> bool {
        self.latency_ms == 0
            && self.jitter_ms == 0
            && self.loss_percent <= 0.0
            && self.bandwidth_kbps == 0
    }
}

pub fn profile_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.json", name))
}

/// Arguments after `tc` that install `profile` as the root qdisc
pub fn netem_args(interface: &str, profile: &NetworkProfile) -> Vec<String> {
    let mut args: Vec<String> = ["qdisc", "add", "dev", interface, "root", "netem"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if profile.latency_ms > 0 {
        args.push("delay".to_string());
        args.push(format!("{}ms", profile.latency_ms));
        if profile.jitter_ms > 0 {
            args.push(format!("{}ms", profile.jitter_ms));
        }
    }
    if profile.loss_percent > 0.0 {
        args.push("loss".to_string());
        args.push(format!("{}%", profile.loss_percent));
    }
    if profile.bandwidth_kbps > 0 {
        args.push("rate".to_string());
        args.push(format!("{}kbit", profile.bandwidth_kbps));
    }
    args
}

/// Arguments after `tc` that remove the root qdisc
pub fn clear_args(interface: &str) -> Vec<String> {
    ["qdisc", "del", "dev", interface, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[async_trait]
pub trait NetworkEmulator: Send {
    /// Replace any active impairment with `profile`
    async fn apply(&mut self, profile: &NetworkProfile) -> Result<()>;

    /// Remove the impairment. Idempotent and never fails.
    async fn clear(&mut self);
}

/// Leaves the network alone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEmulation;

#[async_trait]
impl NetworkEmulator for NoEmulation {
    async fn apply(&mut self, profile: &NetworkProfile) -> Result<()> {
        debug!("Network emulation disabled, ignoring profile {}", profile.name);
        Ok(())
    }

    async fn clear(&mut self) {}
}

/// `tc`/`netem` on a single interface, run through `sudo`
#[derive(Debug, Clone)]
pub struct TcNetem {
    interface: String,
    use_sudo: bool,
    active: Option<String>,
}

impl TcNetem {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            use_sudo: true,
            active: None,
        }
    }

    /// Run `tc` directly, for callers that already hold CAP_NET_ADMIN
    pub fn without_sudo(mut self) -> Self {
        self.use_sudo = false;
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Name of the profile currently applied
    pub fn active_profile(&self) -> Option<&str> {
        self.active.as_deref()
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("tc");
            c
        } else {
            Command::new("tc")
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    async fn delete_root(&self) -> bool {
        match self.command(&clear_args(&self.interface)).status().await {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("tc qdisc del on {} failed: {}", self.interface, e);
                false
            }
        }
    }
}

#[async_trait]
impl NetworkEmulator for TcNetem {
    async fn apply(&mut self, profile: &NetworkProfile) -> Result<()> {
        // Existing rules are cleared first; a missing root qdisc is fine
        self.delete_root().await;
        self.active = None;

        let args = netem_args(&self.interface, profile);
        let status = self
            .command(&args)
            .status()
            .await
            .with_context(|| format!("Failed to run tc on {}", self.interface))?;
        if !status.success() {
            error!("Make sure you run with sudo or have CAP_NET_ADMIN");
            bail!("tc {} exited with {}", args.join(" "), status);
        }

        info!(
            "Network conditions on {}: latency={}ms±{}ms, loss={:.1}%, bw={}kbps",
            self.interface,
            profile.latency_ms,
            profile.jitter_ms,
            profile.loss_percent,
            profile.bandwidth_kbps
        );
        self.active = Some(profile.name.clone());
        Ok(())
    }

    async fn clear(&mut self) {
        let Some(name) = self.active.take() else {
            return;
        };
        if self.delete_root().await {
            info!("Network emulation '{}' cleared from {}", name, self.interface);
        } else {
            warn!("Failed to clear network emulation from {}", self.interface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile(latency: u32, jitter: u32, loss: f64, bw: u32) -> NetworkProfile {
        NetworkProfile {
            name: "test".to_string(),
            latency_ms: latency,
            jitter_ms: jitter,
            loss_percent: loss,
            bandwidth_kbps: bw,
        }
    }

    #[test]
    fn test_netem_args_full_profile() {
        let args = netem_args("lo", &profile(100, 20, 1.5, 512));
        assert_eq!(
            args.join(" "),
            "qdisc add dev lo root netem delay 100ms 20ms loss 1.5% rate 512kbit"
        );
    }

    #[test]
    fn test_netem_args_skips_zero_fields() {
        assert_eq!(
            netem_args("eth0", &profile(0, 20, 0.0, 0)).join(" "),
            "qdisc add dev eth0 root netem"
        );
        assert_eq!(
            netem_args("eth0", &profile(0, 0, 5.0, 0)).join(" "),
            "qdisc add dev eth0 root netem loss 5%"
        );
        assert!(profile(0, 0, 0.0, 0).is_unimpaired());
        assert!(!profile(0, 0, 0.1, 0).is_unimpaired());
    }

    #[test]
    fn test_clear_args() {
        assert_eq!(clear_args("lo").join(" "), "qdisc del dev lo root");
    }

    #[test]
    fn test_profile_from_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("wifi.json"),
            r#"{"latency_ms": 20, "jitter_ms": 5, "loss_percent": 0.5, "bandwidth_kbps": 10000}"#,
        )
        .unwrap();

        let loaded = NetworkProfile::resolve_in(dir.path(), "wifi").unwrap();
        assert_eq!(loaded.name, "wifi");
        assert_eq!(loaded.latency_ms, 20);
        assert_eq!(loaded.bandwidth_kbps, 10000);

        assert!(NetworkProfile::resolve_in(dir.path(), "missing").is_err());
    }

    #[tokio::test]
    async fn test_clear_without_apply_is_noop() {
        let mut emulator = TcNetem::new("lo");
        emulator.clear().await;
        emulator.clear().await;
        assert!(emulator.active_profile().is_none());

        let mut none = NoEmulation;
        none.apply(&profile(10, 0, 0.0, 0)).await.unwrap();
        none.clear().await;
    }
}
