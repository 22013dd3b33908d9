//! Communication configuration
//!
//! TOML-backed settings for acceptors, pools, kernels and server receivers.
//! Every section is optional; missing values fall back to the defaults below.

use crate::{CommunicationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default upper bound for a single encoded message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Top-level configuration for the messaging substrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    /// Largest frame accepted from or written to a peer
    pub max_message_size: usize,
    pub acceptor: AcceptorConfig,
    pub pool: PoolConfig,
    pub kernel: KernelConfig,
    pub server_receiver: ServerReceiverConfig,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            acceptor: AcceptorConfig::default(),
            pool: PoolConfig::default(),
            kernel: KernelConfig::default(),
            server_receiver: ServerReceiverConfig::default(),
        }
    }
}

/// Listening endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    /// Interface to listen on; empty listens on all interfaces
    pub address: String,
    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,
    /// Number of accept-loop threads
    pub threads: usize,
    /// How long a new connection may take to send its ConnectionType byte
    pub handshake_timeout_ms: u64,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            threads: 2,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl AcceptorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Resource pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reservation attempts between sweeps of closed entries
    pub purge_frequency: usize,
    /// Upper bound on one wait for a freed resource inside `reserve_all`
    pub reserve_wait_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            purge_frequency: 1000,
            reserve_wait_ms: 100,
        }
    }
}

impl PoolConfig {
    pub fn reserve_wait(&self) -> Duration {
        Duration::from_millis(self.reserve_wait_ms)
    }
}

/// Fan-out kernel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub threads: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { threads: 3 }
    }
}

/// Server receiver polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerReceiverConfig {
    /// Number of polling threads
    pub threads: usize,
    /// Sleep after a full pass over the pool found nothing to read
    pub idle_backoff_ms: u64,
    /// Check per-sender sequence numbers of received messages
    pub check_sequence: bool,
}

impl Default for ServerReceiverConfig {
    fn default() -> Self {
        Self {
            threads: 5,
            idle_backoff_ms: 500,
            check_sequence: true,
        }
    }
}

impl ServerReceiverConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

impl CommunicationConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CommunicationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CommunicationError::configuration(
                format!("Failed to read {}: {}", path.display(), e),
                None,
            )
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that would leave a component unable to run
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(CommunicationError::configuration(
                "max_message_size must be positive",
                Some("max_message_size"),
            ));
        }
        if self.acceptor.threads == 0 {
            return Err(CommunicationError::configuration(
                "acceptor needs at least one thread",
                Some("acceptor.threads"),
            ));
        }
        if self.pool.purge_frequency == 0 {
            return Err(CommunicationError::configuration(
                "purge_frequency must be positive",
                Some("pool.purge_frequency"),
            ));
        }
        if self.kernel.threads == 0 {
            return Err(CommunicationError::configuration(
                "kernel needs at least one thread",
                Some("kernel.threads"),
            ));
        }
        if self.server_receiver.threads == 0 {
            return Err(CommunicationError::configuration(
                "server receiver needs at least one thread",
                Some("server_receiver.threads"),
            ));
        }
        Ok(())
    }
}
