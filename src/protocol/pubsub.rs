//! Publish/subscribe over TCP (the `mqtt` adapter)
//!
//! A core node runs an in-process broker plus one subscriber; a sensor node
//! only opens publisher connections to a remote broker. Frames are bincode
//! encoded behind a 4-byte little-endian length prefix.
//!
//! Latency is measured two ways:
//! - publishers time the PUBLISH to PUBACK round trip (QoS 1), reported to
//!   the orchestrator through `SendOutcome`
//! - the subscriber derives end-to-end latency from the send timestamp
//!   embedded in each PUBLISH, reported through `delivery_stats`

use super::{context_index, AdapterError, DeliveryStats, ProtocolAdapter, SendOutcome};
use crate::config::{Role, RunConfig};
use crate::utils::current_timestamp_us;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Frames larger than this are rejected as corrupt
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bound on a single frame write before the peer is considered stuck
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection outbound queue depth inside the broker
const OUTBOUND_QUEUE: usize = 1024;

/// Subscriber arrival queue depth
const ARRIVAL_QUEUE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Subscribe {
        topic: String,
    },
    SubAck,
    Publish {
        topic: String,
        msg_id: u64,
        qos: u8,
        /// Wall clock at publish time, microseconds since the Unix epoch
        sent_at_us: u64,
        payload: Vec<u8>,
    },
    PubAck {
        msg_id: u64,
    },
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_LEN {
        return Err(anyhow!("Frame too large: {} bytes", frame_len));
    }

    let mut frame_data = vec![0u8; frame_len];
    reader.read_exact(&mut frame_data).await?;
    Ok(bincode::deserialize(&frame_data).map_err(AdapterError::from)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let frame_bytes = bincode::serialize(frame).map_err(AdapterError::from)?;
    let frame_len = frame_bytes.len() as u32;

    let write_fut = async {
        writer.write_all(&frame_len.to_le_bytes()).await?;
        writer.write_all(&frame_bytes).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    };

    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!(
            "Frame write timed out after {}s",
            WRITE_TIMEOUT.as_secs()
        )),
    }
}

/// MQTT-style topic filter match with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    connection: u64,
    filter: String,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<Vec<Subscription>>,
    next_connection: AtomicU64,
    published: AtomicU64,
}

async fn run_broker(listener: TcpListener, state: Arc<BrokerState>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = state.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!("Broker accepted connection {} from {}", id, peer);
                    connections.spawn(handle_connection(id, stream, state.clone()));
                }
                Err(e) => warn!("Broker accept failed: {}", e),
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    debug!("Broker connection task ended abnormally: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(id: u64, stream: TcpStream, state: Arc<BrokerState>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on connection {}: {}", id, e);
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Broker write to connection {} failed: {}", id, e);
                break;
            }
        }
    });

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection {} closed: {}", id, e);
                break;
            }
        };
        match frame {
            Frame::Subscribe { topic } => {
                debug!("Connection {} subscribed to {}", id, topic);
                state.subscriptions.lock().push(Subscription {
                    connection: id,
                    filter: topic,
                    tx: tx.clone(),
                });
                if tx.send(Frame::SubAck).await.is_err() {
                    break;
                }
            }
            Frame::Publish {
                ref topic,
                msg_id,
                qos,
                ..
            } => {
                state.published.fetch_add(1, Ordering::Relaxed);
                let targets: Vec<mpsc::Sender<Frame>> = state
                    .subscriptions
                    .lock()
                    .iter()
                    .filter(|s| topic_matches(&s.filter, topic))
                    .map(|s| s.tx.clone())
                    .collect();
                for target in targets {
                    // A departed subscriber is cleaned up by its own handler
                    let _ = target.send(frame.clone()).await;
                }
                if qos > 0 && tx.send(Frame::PubAck { msg_id }).await.is_err() {
                    break;
                }
            }
            other => debug!("Connection {} sent unexpected {:?}", id, other),
        }
    }

    state.subscriptions.lock().retain(|s| s.connection != id);
    writer_task.abort();
}

/// Receive-side arrival, queued from the subscriber socket task to the
/// stats consumer
#[derive(Debug, Clone, Copy)]
struct Arrival {
    sent_at_us: u64,
    received_at_us: u64,
}

async fn read_subscription(mut reader: OwnedReadHalf, arrivals: mpsc::Sender<Arrival>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Frame::Publish { sent_at_us, .. }) => {
                let arrival = Arrival {
                    sent_at_us,
                    received_at_us: current_timestamp_us(),
                };
                if arrivals.send(arrival).await.is_err() {
                    break;
                }
            }
            Ok(other) => debug!("Subscriber ignoring {:?}", other),
            Err(e) => {
                debug!("Subscriber connection closed: {}", e);
                break;
            }
        }
    }
}

async fn collect_arrivals(mut arrivals: mpsc::Receiver<Arrival>, stats: Arc<Mutex<DeliveryStats>>) {
    while let Some(arrival) = arrivals.recv().await {
        let mut stats = stats.lock();
        stats.received += 1;
        // Cross-host clock skew can put the arrival before the send
        if arrival.received_at_us >= arrival.sent_at_us {
            let latency_ms = (arrival.received_at_us - arrival.sent_at_us) as f64 / 1000.0;
            stats.latencies_ms.push(latency_ms);
        }
    }
}

async fn connect_with_retry(addr: SocketAddr, wait: Duration, poll: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + wait;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!("Broker at {} not ready: {}", addr, e);
                sleep(poll).await;
            }
            Err(_) => return Err(AdapterError::BrokerUnavailable(addr.to_string()).into()),
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Instant>>>>;

struct Publisher {
    writer: OwnedWriteHalf,
    pending: PendingAcks,
    reader: JoinHandle<()>,
    next_msg_id: u64,
}

async fn read_acks(mut reader: OwnedReadHalf, pending: PendingAcks) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Frame::PubAck { msg_id }) => {
                let arrived = Instant::now();
                if let Some(waiter) = pending.lock().remove(&msg_id) {
                    let _ = waiter.send(arrived);
                }
            }
            Ok(other) => debug!("Publisher ignoring {:?}", other),
            Err(e) => {
                debug!("Publisher connection closed: {}", e);
                break;
            }
        }
    }
    // Wake anything still waiting so it fails fast instead of timing out
    pending.lock().clear();
}

struct Subscriber {
    _writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    collector: JoinHandle<()>,
}

pub struct PubSubAdapter {
    server_ip: String,
    server_port: u16,
    role: Role,
    topic: String,
    qos: u8,
    send_timeout: Duration,
    broker_addr: Option<SocketAddr>,
    broker: Option<JoinHandle<()>>,
    broker_state: Arc<BrokerState>,
    subscriber: Option<Subscriber>,
    stats: Arc<Mutex<DeliveryStats>>,
    publishers: Vec<Publisher>,
}

impl PubSubAdapter {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            server_ip: config.server_ip.clone(),
            server_port: config.server_port,
            role: config.effective_role(),
            topic: config.topic.clone(),
            qos: config.qos,
            send_timeout: config.send_timeout(),
            broker_addr: None,
            broker: None,
            broker_state: Arc::new(BrokerState::default()),
            subscriber: None,
            stats: Arc::new(Mutex::new(DeliveryStats::default())),
            publishers: Vec::new(),
        }
    }

    pub fn broker_addr(&self) -> Option<SocketAddr> {
        self.broker_addr
    }

    /// PUBLISH frames the embedded broker has routed
    pub fn broker_published(&self) -> u64 {
        self.broker_state.published.load(Ordering::Relaxed)
    }

    async fn resolve_broker(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.broker_addr {
            return Ok(addr);
        }
        let target = format!("{}:{}", self.server_ip, self.server_port);
        let resolved = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve {}", target))?
            .next();
        resolved.ok_or_else(|| anyhow!("No address for {}", target))
    }

    async fn start_subscriber(&mut self, broker: SocketAddr) -> Result<()> {
        let stream = connect_with_retry(
            broker,
            crate::defaults::SERVER_READY_TIMEOUT,
            crate::defaults::SERVER_READY_POLL,
        )
        .await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Subscribe {
                topic: self.topic.clone(),
            },
        )
        .await?;
        match timeout(crate::defaults::SERVER_READY_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(Frame::SubAck)) => {}
            Ok(Ok(other)) => return Err(anyhow!("Expected SUBACK, got {:?}", other)),
            Ok(Err(e)) => return Err(e.context("Subscriber handshake failed")),
            Err(_) => return Err(AdapterError::BrokerUnavailable(broker.to_string()).into()),
        }

        let (arrivals_tx, arrivals_rx) = mpsc::channel(ARRIVAL_QUEUE);
        self.subscriber = Some(Subscriber {
            _writer: writer,
            reader: tokio::spawn(read_subscription(reader, arrivals_tx)),
            collector: tokio::spawn(collect_arrivals(arrivals_rx, self.stats.clone())),
        });
        info!("Subscriber listening on {}", self.topic);
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for PubSubAdapter {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.broker.is_some() || self.subscriber.is_some() {
            return Ok(());
        }
        if self.role == Role::Sensor {
            let broker = self.resolve_broker().await?;
            self.broker_addr = Some(broker);
            debug!("Sensor role, publishing to remote broker {}", broker);
            return Ok(());
        }

        let addr = format!("{}:{}", self.server_ip, self.server_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AdapterError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr()?;
        info!("Broker listening on {}", local);
        self.broker_addr = Some(local);
        self.broker = Some(tokio::spawn(run_broker(
            listener,
            self.broker_state.clone(),
        )));

        self.start_subscriber(local).await
    }

    async fn start_clients(&mut self, count: usize) -> Result<()> {
        let broker = self.resolve_broker().await?;
        self.broker_addr = Some(broker);

        let started = Instant::now();
        let mut publishers = Vec::with_capacity(count);
        let connect_all = async {
            for i in 0..count {
                let stream = TcpStream::connect(broker)
                    .await
                    .with_context(|| format!("Publisher {} failed to connect to {}", i, broker))?;
                socket2::SockRef::from(&stream).set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
                publishers.push(Publisher {
                    writer,
                    pending: pending.clone(),
                    reader: tokio::spawn(read_acks(reader, pending)),
                    next_msg_id: 0,
                });
            }
            Ok::<(), anyhow::Error>(())
        };
        let result = timeout(crate::defaults::CLIENT_READY_TIMEOUT, connect_all).await;

        let not_ready = |ready: usize| AdapterError::ContextsNotReady {
            ready,
            expected: count,
            waited_ms: started.elapsed().as_millis(),
        };
        match result {
            Ok(Ok(())) => {
                info!("{} publishers connected to {}", count, broker);
                self.publishers = publishers;
                Ok(())
            }
            Ok(Err(e)) => {
                let ready = publishers.len();
                abort_publishers(&mut publishers);
                Err(e.context(not_ready(ready)))
            }
            Err(_) => {
                let ready = publishers.len();
                abort_publishers(&mut publishers);
                Err(not_ready(ready).into())
            }
        }
    }

    async fn send_data(&mut self, client_id: &str, payload: &[u8]) -> Result<SendOutcome> {
        if self.publishers.is_empty() {
            return Err(AdapterError::NotStarted("send_data").into());
        }
        let index = context_index(client_id, self.publishers.len());
        let publisher = &mut self.publishers[index];
        publisher.next_msg_id += 1;
        let msg_id = publisher.next_msg_id;

        let frame = Frame::Publish {
            topic: self.topic.clone(),
            msg_id,
            qos: self.qos,
            sent_at_us: current_timestamp_us(),
            payload: payload.to_vec(),
        };

        let ack = if self.qos > 0 {
            let (tx, rx) = oneshot::channel();
            publisher.pending.lock().insert(msg_id, tx);
            Some(rx)
        } else {
            None
        };

        if let Err(e) = write_frame(&mut publisher.writer, &frame).await {
            debug!("{} publish failed: {}", client_id, e);
            publisher.pending.lock().remove(&msg_id);
            return Ok(SendOutcome::failed());
        }

        let Some(ack) = ack else {
            return Ok(SendOutcome::unacknowledged());
        };
        let deadline = Instant::now() + self.send_timeout;
        match timeout_at(deadline, ack).await {
            Ok(Ok(acked_at)) => Ok(SendOutcome::acknowledged(acked_at)),
            Ok(Err(_)) => {
                debug!("{} lost its connection before PUBACK {}", client_id, msg_id);
                Ok(SendOutcome::failed())
            }
            Err(_) => {
                debug!("{} timed out waiting for PUBACK {}", client_id, msg_id);
                publisher.pending.lock().remove(&msg_id);
                Ok(SendOutcome::failed())
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        abort_publishers(&mut self.publishers);
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.reader.abort();
            let _ = subscriber.reader.await;
            // The collector drains what was queued, then ends with the channel
            let _ = timeout(Duration::from_secs(1), subscriber.collector).await;
        }
        if let Some(broker) = self.broker.take() {
            broker.abort();
            let _ = broker.await;
            // Dropping the queued senders ends the per-connection writers
            self.broker_state.subscriptions.lock().clear();
            debug!("Broker stopped after routing {} messages", self.broker_published());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        let broker_ok = self.broker.as_ref().map_or(true, |h| !h.is_finished());
        let subscriber_ok = self
            .subscriber
            .as_ref()
            .map_or(true, |s| !s.reader.is_finished());
        broker_ok && subscriber_ok
    }

    fn delivery_stats(&self) -> Option<DeliveryStats> {
        if self.subscriber.is_none() && self.broker.is_none() {
            return None;
        }
        Some(self.stats.lock().clone())
    }
}

fn abort_publishers(publishers: &mut Vec<Publisher>) {
    for publisher in publishers.drain(..) {
        publisher.reader.abort();
    }
}
