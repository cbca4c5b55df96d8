//! Managed external processes
//!
//! Brokers and passive-mode binaries run as child processes. They are
//! stopped with SIGTERM first and only killed if they outlive a grace
//! period.

use super::AdapterError;
use anyhow::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

pub struct ManagedProcess {
    label: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    exit_status: Mutex<Option<ExitStatus>>,
    grace: Duration,
}

impl ManagedProcess {
    /// Spawn `argv[0]` with the remaining arguments
    pub fn spawn(label: &str, argv: &[String], cwd: Option<&Path>) -> Result<Self, AdapterError> {
        let (program, args) = argv.split_first().ok_or_else(|| AdapterError::ProcessSpawn {
            command: label.to_string(),
            reason: "empty command line".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| AdapterError::ProcessSpawn {
            command: argv.join(" "),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!("Spawned {} ({}) pid={:?}", label, argv.join(" "), pid);

        Ok(Self {
            label: label.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            exit_status: Mutex::new(None),
            grace: crate::defaults::PROCESS_STOP_GRACE,
        })
    }

    /// Override the SIGTERM to SIGKILL grace period
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still running
    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} exited with {}", self.label, status);
                *self.exit_status.lock() = Some(status);
                *guard = None;
                false
            }
            Err(e) => {
                warn!("Failed to poll {}: {}", self.label, e);
                false
            }
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock()
    }

    /// Poll until the process is running and `ready_file` (when given)
    /// exists, for at most `wait`
    pub async fn wait_ready(
        &self,
        ready_file: Option<&Path>,
        wait: Duration,
        poll: Duration,
    ) -> Result<(), AdapterError> {
        let deadline = Instant::now() + wait;
        loop {
            sleep(poll).await;
            if !self.is_running() {
                return Err(AdapterError::ProcessSpawn {
                    command: self.label.clone(),
                    reason: format!("exited during startup ({:?})", self.exit_status()),
                });
            }
            if ready_file.map_or(true, |f| f.exists()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AdapterError::ProcessSpawn {
                    command: self.label.clone(),
                    reason: format!("not ready after {}ms", wait.as_millis()),
                });
            }
        }
    }

    /// Terminate gracefully, then forcibly. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            *self.exit_status.lock() = Some(status);
            return Ok(());
        }

        send_terminate(&mut child);
        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} stopped with {}", self.label, status);
                *self.exit_status.lock() = Some(status);
            }
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.label, e),
            Err(_) => {
                info!(
                    "{} still running after {}ms, killing",
                    self.label,
                    self.grace.as_millis()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.label, e);
                } else if let Ok(status) = child.wait().await {
                    *self.exit_status.lock() = Some(status);
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_spawn_and_graceful_stop() {
        let process = ManagedProcess::spawn("sleeper", &argv(&["sleep", "30"]), None).unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());

        let started = std::time::Instant::now();
        process.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!process.is_running());
        assert!(process.exit_status().is_some());

        // Second stop is a no-op
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_after_grace_period() {
        let process = ManagedProcess::spawn(
            "stubborn",
            &argv(&["sh", "-c", "trap '' TERM; while true; do sleep 0.05; done"]),
            None,
        )
        .unwrap()
        .with_grace(Duration::from_millis(300));
        sleep(Duration::from_millis(100)).await;

        process.stop().await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = ManagedProcess::spawn("missing", &argv(&["/nonexistent/binary"]), None)
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::ProcessSpawn { .. }));

        let err = ManagedProcess::spawn("empty", &[], None).err().unwrap();
        assert!(matches!(err, AdapterError::ProcessSpawn { .. }));
    }

    #[tokio::test]
    async fn test_wait_ready_with_file() {
        let dir = tempdir().unwrap();
        let ready = dir.path().join("ready");
        let script = format!("sleep 0.2; touch {}; sleep 30", ready.display());
        let process = ManagedProcess::spawn("server", &argv(&["sh", "-c", &script]), None).unwrap();

        process
            .wait_ready(Some(&ready), Duration::from_secs(2), Duration::from_millis(100))
            .await
            .unwrap();
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_detects_early_exit() {
        let process = ManagedProcess::spawn("quitter", &argv(&["true"]), None).unwrap();
        let result = process
            .wait_ready(None, Duration::from_secs(2), Duration::from_millis(100))
            .await;
        assert!(result.is_err());
        process.stop().await.unwrap();
    }
}
