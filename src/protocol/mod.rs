//! # Protocol Adapters
//!
//! The `ProtocolAdapter` trait is the only thing the orchestrator knows
//! about a transport. Every adapter exposes the same lifecycle:
//!
//! 1. `start_server` brings up the receiving side (broker, listener or an
//!    external server process) and fails loudly if it cannot.
//! 2. `start_clients(n)` opens `n` independent send contexts so per-client
//!    concurrency is comparable across protocols.
//! 3. `send_data` performs one send through the context selected by the
//!    client id and reports whether a round trip completed, and when.
//! 4. `stop` releases everything and is safe after partial startup.
//!
//! Adapters are resolved by name through an `AdapterRegistry` once per run.

use crate::config::{RunConfig, TransportMode};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

pub mod datagram;
pub mod fault;
pub mod passive;
pub mod process;
pub mod pubsub;

pub use datagram::DatagramAdapter;
pub use fault::{FaultConfig, FaultInjector};
pub use passive::PassiveAdapter;
pub use process::ManagedProcess;
pub use pubsub::PubSubAdapter;

/// Errors adapters raise during startup or on misuse
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),

    #[error("failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("{ready} of {expected} client contexts ready after {waited_ms}ms")]
    ContextsNotReady {
        ready: usize,
        expected: usize,
        waited_ms: u128,
    },

    #[error("broker at {0} did not become available")]
    BrokerUnavailable(String),

    #[error("failed to spawn `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("{0} called before the adapter was started")]
    NotStarted(&'static str),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for AdapterError {
    fn from(e: bincode::Error) -> Self {
        AdapterError::Codec(e.to_string())
    }
}

/// Result of one `send_data` call
///
/// `completed_at` is set only when the transport produced a genuine round
/// trip (an ACK, a response or a broker acknowledgement). The orchestrator
/// derives a latency sample from it and ignores it when it is not later
/// than the send start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub delivered: bool,
    pub completed_at: Option<Instant>,
}

impl SendOutcome {
    /// Round trip completed at `at`
    pub fn acknowledged(at: Instant) -> Self {
        Self {
            delivered: true,
            completed_at: Some(at),
        }
    }

    /// Handed to the transport, but no round trip to time
    pub fn unacknowledged() -> Self {
        Self {
            delivered: true,
            completed_at: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            delivered: false,
            completed_at: None,
        }
    }
}

/// Receive-side counters an adapter accumulates out of band
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryStats {
    pub received: u64,
    pub latencies_ms: Vec<f64>,
}

/// Uniform capability set over a concrete transport
///
/// The orchestrator serialises calls, but adapters run their own background
/// tasks concurrently with `send_data` and must keep shared state behind
/// locks or channels.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Registry name of the protocol
    fn name(&self) -> &str;

    /// Bring up the receiving side. Calling it twice is a no-op.
    async fn start_server(&mut self) -> Result<()>;

    /// Open `count` independent send contexts, failing with
    /// `AdapterError::ContextsNotReady` if they are not up in time.
    async fn start_clients(&mut self, count: usize) -> Result<()>;

    /// Send `payload` through the context chosen by `client_id`
    ///
    /// Transport failures and timeouts return `SendOutcome::failed()`;
    /// `Err` is reserved for conditions worth recording as errors.
    async fn send_data(&mut self, client_id: &str, payload: &[u8]) -> Result<SendOutcome>;

    /// Release all contexts and servers. Never fails on resources that were
    /// never acquired or are already gone.
    async fn stop(&mut self) -> Result<()>;

    /// Cheap liveness probe polled before every send
    fn is_alive(&self) -> bool;

    /// Out-of-band receive counters, for adapters that have them
    fn delivery_stats(&self) -> Option<DeliveryStats> {
        None
    }

    /// Adapters whose traffic is driven by external processes report
    /// `Passive` regardless of the configured mode.
    fn transport_mode(&self) -> TransportMode {
        TransportMode::Active
    }
}

/// Pick a send context from the numeric suffix of a client id
///
/// `client_7` with 3 contexts maps to index 1. Ids without a numeric suffix
/// map to 0.
pub fn context_index(client_id: &str, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let digits_start = client_id
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    client_id[digits_start..]
        .parse::<u64>()
        .map(|n| (n % count as u64) as usize)
        .unwrap_or(0)
}

type AdapterFactory = Box<dyn Fn(&RunConfig) -> Result<Box<dyn ProtocolAdapter>> + Send + Sync>;

/// Protocol name to adapter factory lookup
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Registry with no protocols
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in adapters: `mqtt`, `coap` and `my_udp`
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("mqtt", |config| {
            Ok(Box::new(PubSubAdapter::new(config)) as Box<dyn ProtocolAdapter>)
        });
        registry.register("coap", |config| {
            Ok(Box::new(DatagramAdapter::new(config)) as Box<dyn ProtocolAdapter>)
        });
        registry.register("my_udp", |config| {
            Ok(Box::new(PassiveAdapter::new(config)?) as Box<dyn ProtocolAdapter>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&RunConfig) -> Result<Box<dyn ProtocolAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the adapter for `config.protocol`
    pub fn create(&self, config: &RunConfig) -> Result<Box<dyn ProtocolAdapter>> {
        let factory = self
            .factories
            .get(&config.protocol)
            .ok_or_else(|| AdapterError::UnknownProtocol(config.protocol.clone()))?;
        factory(config)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
