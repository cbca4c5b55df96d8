//! Failure injection by composition
//!
//! `FaultInjector` wraps any adapter and perturbs `send_data`: it can drop a
//! message before it reaches the transport, fail the call with an error, or
//! delay it. Everything else is delegated untouched.

use super::{DeliveryStats, ProtocolAdapter, SendOutcome};
use crate::config::TransportMode;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fault probabilities and delay applied to each send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance a send is silently dropped and reported as failed
    #[serde(default)]
    pub drop_probability: f64,
    /// Chance a send returns an error instead of reaching the transport
    #[serde(default)]
    pub error_probability: f64,
    /// Milliseconds added before every send that is not dropped or failed
    #[serde(default)]
    pub added_delay_ms: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl FaultConfig {
    pub fn added_delay(&self) -> Duration {
        Duration::from_millis(self.added_delay_ms)
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.drop_probability)
            && (0.0..=1.0).contains(&self.error_probability)
    }
}

pub struct FaultInjector {
    inner: Box<dyn ProtocolAdapter>,
    config: FaultConfig,
    rng: StdRng,
    dropped: u64,
    injected_errors: u64,
}

impl FaultInjector {
    pub fn new(inner: Box<dyn ProtocolAdapter>, config: FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner,
            config,
            rng,
            dropped: 0,
            injected_errors: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn injected_errors(&self) -> u64 {
        self.injected_errors
    }
}

#[async_trait]
impl ProtocolAdapter for FaultInjector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start_server(&mut self) -> Result<()> {
        self.inner.start_server().await
    }

    async fn start_clients(&mut self, count: usize) -> Result<()> {
        self.inner.start_clients(count).await
    }

    async fn send_data(&mut self, client_id: &str, payload: &[u8]) -> Result<SendOutcome> {
        if self.rng.gen::<f64>() < self.config.drop_probability {
            self.dropped += 1;
            debug!("Injected drop for {}", client_id);
            return Ok(SendOutcome::failed());
        }
        if self.rng.gen::<f64>() < self.config.error_probability {
            self.injected_errors += 1;
            return Err(anyhow!("injected failure for {}", client_id));
        }
        if self.config.added_delay_ms > 0 {
            tokio::time::sleep(self.config.added_delay()).await;
        }
        self.inner.send_data(client_id, payload).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.inner.stop().await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    fn delivery_stats(&self) -> Option<DeliveryStats> {
        self.inner.delivery_stats()
    }

    fn transport_mode(&self) -> TransportMode {
        self.inner.transport_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    /// Acknowledges every send immediately
    struct Echo {
        sends: u64,
    }

    #[async_trait]
    impl ProtocolAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn start_server(&mut self) -> Result<()> {
            Ok(())
        }
        async fn start_clients(&mut self, _count: usize) -> Result<()> {
            Ok(())
        }
        async fn send_data(&mut self, _client_id: &str, _payload: &[u8]) -> Result<SendOutcome> {
            self.sends += 1;
            Ok(SendOutcome::acknowledged(Instant::now()))
        }
        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_alive(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_passthrough_without_faults() {
        let mut adapter = FaultInjector::new(Box::new(Echo { sends: 0 }), FaultConfig::default());
        assert_eq!(adapter.name(), "echo");
        for _ in 0..20 {
            assert!(adapter.send_data("client_0", b"x").await.unwrap().delivered);
        }
        assert_eq!(adapter.dropped(), 0);
        assert_eq!(adapter.injected_errors(), 0);
    }

    #[tokio::test]
    async fn test_always_drop() {
        let config = FaultConfig {
            drop_probability: 1.0,
            seed: Some(1),
            ..FaultConfig::default()
        };
        let mut adapter = FaultInjector::new(Box::new(Echo { sends: 0 }), config);
        for _ in 0..10 {
            assert_eq!(
                adapter.send_data("client_0", b"x").await.unwrap(),
                SendOutcome::failed()
            );
        }
        assert_eq!(adapter.dropped(), 10);
    }

    #[tokio::test]
    async fn test_always_error() {
        let config = FaultConfig {
            error_probability: 1.0,
            seed: Some(1),
            ..FaultConfig::default()
        };
        let mut adapter = FaultInjector::new(Box::new(Echo { sends: 0 }), config);
        assert!(adapter.send_data("client_3", b"x").await.is_err());
        assert_eq!(adapter.injected_errors(), 1);
    }

    #[tokio::test]
    async fn test_partial_drop_rate_is_reproducible() {
        let config = FaultConfig {
            drop_probability: 0.3,
            seed: Some(99),
            ..FaultConfig::default()
        };
        let mut a = FaultInjector::new(Box::new(Echo { sends: 0 }), config.clone());
        let mut b = FaultInjector::new(Box::new(Echo { sends: 0 }), config);
        for _ in 0..1_000 {
            let x = a.send_data("client_0", b"x").await.unwrap();
            let y = b.send_data("client_0", b"x").await.unwrap();
            assert_eq!(x.delivered, y.delivered);
        }
        assert_eq!(a.dropped(), b.dropped());
        assert!((200..400).contains(&a.dropped()), "dropped {}", a.dropped());
    }

    #[test]
    fn test_config_from_json() {
        let config: FaultConfig =
            serde_json::from_str(r#"{"drop_probability": 0.1, "added_delay_ms": 20}"#).unwrap();
        assert_eq!(config.added_delay(), Duration::from_millis(20));
        assert_eq!(config.error_probability, 0.0);
        assert!(config.is_valid());
        assert!(!FaultConfig {
            drop_probability: 1.5,
            ..FaultConfig::default()
        }
        .is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_added_delay() {
        let config = FaultConfig {
            added_delay_ms: 250,
            ..FaultConfig::default()
        };
        let mut adapter = FaultInjector::new(Box::new(Echo { sends: 0 }), config);
        let t0 = Instant::now();
        let outcome = adapter.send_data("client_0", b"x").await.unwrap();
        assert_eq!(outcome.completed_at.unwrap() - t0, Duration::from_millis(250));
    }
}
