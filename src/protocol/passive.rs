//! Passive-mode adapter (the `my_udp` protocol)
//!
//! The traffic is generated by external binaries: one server that appends
//! `<seq> <round_trip_us>` lines to its receive log, and one client process
//! per simulated device. The orchestrator only waits and then parses the
//! log, so `send_data` is never part of a passive run.

use super::process::ManagedProcess;
use super::{AdapterError, ProtocolAdapter, SendOutcome};
use crate::config::{Role, RunConfig, TransportMode};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const DEFAULT_SERVER: [&str; 3] = ["./custom_udp_server", "{ip}", "{port}"];
const DEFAULT_CLIENT: [&str; 4] = ["./custom_udp_client", "{ip}", "{port}", "{id}"];

/// Replace `{ip}`, `{port}` and `{id}` in every argument
pub fn substitute(argv: &[String], ip: &str, port: u16, id: Option<usize>) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            let arg = arg.replace("{ip}", ip).replace("{port}", &port.to_string());
            match id {
                Some(id) => arg.replace("{id}", &id.to_string()),
                None => arg,
            }
        })
        .collect()
}

fn or_default(command: &[String], default: &[&str]) -> Vec<String> {
    if command.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        command.to_vec()
    }
}

pub struct PassiveAdapter {
    server_ip: String,
    server_port: u16,
    role: Role,
    server_command: Vec<String>,
    client_command: Vec<String>,
    ready_file: Option<PathBuf>,
    recv_log: PathBuf,
    server: Option<ManagedProcess>,
    clients: Vec<ManagedProcess>,
}

impl PassiveAdapter {
    pub fn new(config: &RunConfig) -> Result<Self, AdapterError> {
        let server_command = or_default(&config.passive.server_command, &DEFAULT_SERVER);
        let client_command = or_default(&config.passive.client_command, &DEFAULT_CLIENT);
        if server_command[0].trim().is_empty() || client_command[0].trim().is_empty() {
            return Err(AdapterError::ProcessSpawn {
                command: "passive".to_string(),
                reason: "command lines must name a program".to_string(),
            });
        }
        Ok(Self {
            server_ip: config.server_ip.clone(),
            server_port: config.server_port,
            role: config.effective_role(),
            server_command,
            client_command,
            ready_file: config.passive.ready_file.clone(),
            recv_log: config.recv_log.clone(),
            server: None,
            clients: Vec::new(),
        })
    }

    /// Directory the server runs in, so its receive log lands at `recv_log`
    fn log_dir(&self) -> Option<&Path> {
        self.recv_log
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    pub fn running_clients(&self) -> usize {
        self.clients.iter().filter(|c| c.is_running()).count()
    }
}

#[async_trait]
impl ProtocolAdapter for PassiveAdapter {
    fn name(&self) -> &str {
        "my_udp"
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        if self.role == Role::Sensor {
            debug!("Sensor role, no local passive server");
            return Ok(());
        }

        if self.recv_log.exists() {
            debug!("Removing stale {}", self.recv_log.display());
            std::fs::remove_file(&self.recv_log)?;
        }

        let argv = substitute(&self.server_command, &self.server_ip, self.server_port, None);
        let server = ManagedProcess::spawn("passive server", &argv, self.log_dir())?;
        if let Err(e) = server
            .wait_ready(
                self.ready_file.as_deref(),
                crate::defaults::SERVER_READY_TIMEOUT,
                crate::defaults::SERVER_READY_POLL,
            )
            .await
        {
            server.stop().await?;
            return Err(e.into());
        }

        info!("Passive server running: {}", argv.join(" "));
        self.server = Some(server);
        Ok(())
    }

    async fn start_clients(&mut self, count: usize) -> Result<()> {
        for id in 0..count {
            let argv = substitute(&self.client_command, &self.server_ip, self.server_port, Some(id));
            let client = ManagedProcess::spawn(&format!("passive client {}", id), &argv, None)?;
            self.clients.push(client);
        }

        // Every client must still be running after one poll interval
        let started = Instant::now();
        sleep(crate::defaults::SERVER_READY_POLL).await;
        let ready = self.running_clients();
        if ready == count {
            info!("{} passive clients running", count);
            return Ok(());
        }
        warn!("Only {} of {} passive clients running", ready, count);
        Err(AdapterError::ContextsNotReady {
            ready,
            expected: count,
            waited_ms: started.elapsed().as_millis(),
        }
        .into())
    }

    async fn send_data(&mut self, client_id: &str, _payload: &[u8]) -> Result<SendOutcome> {
        debug!("Passive adapter ignores send for {}", client_id);
        Ok(SendOutcome::failed())
    }

    async fn stop(&mut self) -> Result<()> {
        for client in self.clients.drain(..) {
            client.stop().await?;
        }
        if let Some(server) = self.server.take() {
            server.stop().await?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.server.as_ref().map_or(true, |s| s.is_running())
    }

    fn transport_mode(&self) -> TransportMode {
        TransportMode::Passive
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PassiveCommands;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_substitute_placeholders() {
        let argv = vec!["srv".to_string(), "{ip}:{port}".to_string(), "id={id}".to_string()];
        assert_eq!(
            substitute(&argv, "10.0.0.1", 5000, Some(3)),
            vec!["srv", "10.0.0.1:5000", "id=3"]
        );
        assert_eq!(substitute(&argv, "h", 1, None)[2], "id={id}");
    }

    #[test]
    fn test_default_commands() {
        let adapter = PassiveAdapter::new(&RunConfig::new("my_udp")).unwrap();
        assert_eq!(adapter.server_command[0], "./custom_udp_server");
        assert_eq!(adapter.client_command.len(), 4);
        assert_eq!(adapter.transport_mode(), TransportMode::Passive);
    }

    #[tokio::test]
    async fn test_server_writes_log_in_its_directory() {
        let dir = tempdir().unwrap();
        let mut config = RunConfig::new("my_udp");
        config.recv_log = dir.path().join("recv.log");
        config.passive = PassiveCommands {
            server_command: sh("echo '1 1500' > recv.log; touch ready; sleep 30"),
            client_command: sh("sleep 30 # {id}"),
            ready_file: Some(dir.path().join("ready")),
        };
        std::fs::write(&config.recv_log, "stale\n").unwrap();

        let mut adapter = PassiveAdapter::new(&config).unwrap();
        adapter.start_server().await.unwrap();
        adapter.start_clients(2).await.unwrap();
        assert!(adapter.is_alive());
        assert_eq!(adapter.running_clients(), 2);

        let log = std::fs::read_to_string(&config.recv_log).unwrap();
        assert_eq!(log, "1 1500\n");

        adapter.stop().await.unwrap();
        adapter.stop().await.unwrap();
        assert_eq!(adapter.running_clients(), 0);
    }

    #[tokio::test]
    async fn test_server_that_exits_fails_startup() {
        let mut config = RunConfig::new("my_udp");
        config.passive.server_command = sh("exit 1");
        let dir = tempdir().unwrap();
        config.recv_log = dir.path().join("recv.log");

        let mut adapter = PassiveAdapter::new(&config).unwrap();
        assert!(adapter.start_server().await.is_err());
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_clients_that_exit_are_not_ready() {
        let mut config = RunConfig::new("my_udp");
        config.role = Some(Role::Sensor);
        config.passive.client_command = sh("exit 0");

        let mut adapter = PassiveAdapter::new(&config).unwrap();
        adapter.start_server().await.unwrap();
        let err = adapter.start_clients(2).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<AdapterError>(),
            Some(AdapterError::ContextsNotReady { ready: 0, expected: 2, .. })
        ));
        adapter.stop().await.unwrap();
    }
}
