//! Confirmable request/response over UDP (the `coap` adapter)
//!
//! Every request carries a per-context sequence number and the responder
//! echoes it back in an ACK. A send succeeds when the matching ACK arrives
//! within the send timeout; latency is the round trip. ACKs for earlier
//! requests that arrive late are discarded.

use super::{context_index, AdapterError, DeliveryStats, ProtocolAdapter, SendOutcome};
use crate::config::{Role, RunConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Largest datagram we expect to receive
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatagramKind {
    Request,
    Ack,
}

/// Wire format of every datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    pub kind: DatagramKind,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdapterError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

struct ClientContext {
    socket: UdpSocket,
    next_seq: u64,
}

pub struct DatagramAdapter {
    server_ip: String,
    server_port: u16,
    role: Role,
    send_timeout: Duration,
    server_addr: Option<SocketAddr>,
    responder: Option<JoinHandle<()>>,
    requests_seen: Arc<AtomicU64>,
    contexts: Vec<ClientContext>,
}

impl DatagramAdapter {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            server_ip: config.server_ip.clone(),
            server_port: config.server_port,
            role: config.effective_role(),
            send_timeout: config.send_timeout(),
            server_addr: None,
            responder: None,
            requests_seen: Arc::new(AtomicU64::new(0)),
            contexts: Vec::new(),
        }
    }

    /// Address clients send to: the bound responder, else the configured one
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    async fn resolve_server(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.server_ip, self.server_port);
        let resolved = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve {}", target))?
            .next();
        resolved.ok_or_else(|| anyhow::anyhow!("No address for {}", target))
    }

    async fn respond(socket: UdpSocket, seen: Arc<AtomicU64>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable from a departed client surfaces
                    // here on some platforms; keep serving.
                    debug!("Responder receive error: {}", e);
                    continue;
                }
            };
            let request = match Datagram::from_bytes(&buf[..len]) {
                Ok(d) if d.kind == DatagramKind::Request => d,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", peer, e);
                    continue;
                }
            };
            seen.fetch_add(1, Ordering::Relaxed);

            let ack = Datagram {
                kind: DatagramKind::Ack,
                seq: request.seq,
                payload: Vec::new(),
            };
            match ack.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        debug!("Failed to ACK {} to {}: {}", request.seq, peer, e);
                    }
                }
                Err(e) => warn!("Failed to encode ACK: {}", e),
            }
        }
    }

    fn open_context(server: SocketAddr) -> Result<UdpSocket> {
        let domain = Domain::for_address(server);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        let local: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        socket.bind(&local.into())?;
        socket.connect(&server.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[async_trait]
impl ProtocolAdapter for DatagramAdapter {
    fn name(&self) -> &str {
        "coap"
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.responder.is_some() {
            return Ok(());
        }
        if self.role == Role::Sensor {
            self.server_addr = Some(self.resolve_server().await?);
            debug!("Sensor role, using remote responder {:?}", self.server_addr);
            return Ok(());
        }

        let addr = format!("{}:{}", self.server_ip, self.server_port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| AdapterError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local = socket.local_addr()?;
        info!("CoAP responder listening on {}", local);

        self.server_addr = Some(local);
        self.responder = Some(tokio::spawn(Self::respond(
            socket,
            self.requests_seen.clone(),
        )));
        Ok(())
    }

    async fn start_clients(&mut self, count: usize) -> Result<()> {
        let server = match self.server_addr {
            Some(addr) => addr,
            None => self.resolve_server().await?,
        };
        self.server_addr = Some(server);

        let started = Instant::now();
        let opened = timeout(crate::defaults::CLIENT_READY_TIMEOUT, async {
            let mut contexts = Vec::with_capacity(count);
            for _ in 0..count {
                contexts.push(ClientContext {
                    socket: Self::open_context(server)?,
                    next_seq: 0,
                });
            }
            Ok::<_, anyhow::Error>(contexts)
        })
        .await;

        match opened {
            Ok(Ok(contexts)) => {
                self.contexts = contexts;
                info!("{} CoAP client contexts ready", count);
                Ok(())
            }
            Ok(Err(e)) => Err(e.context(AdapterError::ContextsNotReady {
                ready: 0,
                expected: count,
                waited_ms: started.elapsed().as_millis(),
            })),
            Err(_) => Err(AdapterError::ContextsNotReady {
                ready: 0,
                expected: count,
                waited_ms: started.elapsed().as_millis(),
            }
            .into()),
        }
    }

    async fn send_data(&mut self, client_id: &str, payload: &[u8]) -> Result<SendOutcome> {
        if self.contexts.is_empty() {
            return Err(AdapterError::NotStarted("send_data").into());
        }
        let index = context_index(client_id, self.contexts.len());
        let context = &mut self.contexts[index];
        context.next_seq += 1;
        let seq = context.next_seq;

        let request = Datagram {
            kind: DatagramKind::Request,
            seq,
            payload: payload.to_vec(),
        }
        .to_bytes()?;

        if let Err(e) = context.socket.send(&request).await {
            debug!("{} send failed: {}", client_id, e);
            return Ok(SendOutcome::failed());
        }

        let deadline = Instant::now() + self.send_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match timeout_at(deadline, context.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    debug!("{} receive failed: {}", client_id, e);
                    return Ok(SendOutcome::failed());
                }
                Err(_) => {
                    debug!("{} timed out waiting for ACK {}", client_id, seq);
                    return Ok(SendOutcome::failed());
                }
            };
            match Datagram::from_bytes(&buf[..len]) {
                Ok(ack) if ack.kind == DatagramKind::Ack && ack.seq == seq => {
                    return Ok(SendOutcome::acknowledged(Instant::now()));
                }
                Ok(stale) => debug!("{} ignoring stale ACK {}", client_id, stale.seq),
                Err(e) => debug!("{} ignoring malformed reply: {}", client_id, e),
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.contexts.clear();
        if let Some(responder) = self.responder.take() {
            responder.abort();
            let _ = responder.await;
            debug!(
                "CoAP responder stopped after {} requests",
                self.requests_seen.load(Ordering::Relaxed)
            );
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        match &self.responder {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }

    fn delivery_stats(&self) -> Option<DeliveryStats> {
        self.responder.as_ref().map(|_| DeliveryStats {
            received: self.requests_seen.load(Ordering::Relaxed),
            latencies_ms: Vec::new(),
        })
    }
}
