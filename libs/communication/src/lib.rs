//! Communication Infrastructure
//!
//! Messaging substrate between load-test worker processes and their console,
//! built directly on TCP sockets and OS threads:
//!
//! - [`Acceptor`] listens on a port, reads the one-byte [`ConnectionType`]
//!   handshake and sorts accepted sockets into per-type [`ResourcePool`]s.
//! - Senders stamp each [`Message`] with their identity and a sequence number
//!   and write length-prefixed frames; [`FanOutServerSender`] broadcasts to
//!   every pooled connection through a [`Kernel`] of writer threads.
//! - Receivers deliver messages in order, checking per-sender sequence
//!   numbers; [`ServerReceiver`] polls every connection of one pool.
//! - A close-communication frame announces an orderly shutdown so peers can
//!   tell it apart from a broken connection.

pub mod codec;
pub mod config;
pub mod error;
pub mod kernel;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod receivers;
pub mod resource_pool;
pub mod senders;
pub mod transports;

pub use config::{
    AcceptorConfig, CommunicationConfig, KernelConfig, PoolConfig, ServerReceiverConfig,
};
pub use error::{CommunicationError, Result};
pub use kernel::Kernel;
pub use message::{Message, MessageBody, SenderInformation};
pub use metrics::{CommunicationMetrics, MetricsTracker};
pub use queue::{MessageQueue, ThreadSafeQueue};
pub use receivers::{ClientReceiver, Receiver, ServerReceiver, StreamReceiver};
pub use resource_pool::{PoolListener, Reservation, Resource, ResourceHandle, ResourcePool};
pub use senders::{
    ClientSender, FanOutServerSender, FanOutStreamSender, HandlerChainSender, MessageHandler,
    PeerFailureListener, QueuedSender, QueuedSenderDecorator, Sender, StreamSender,
};
pub use transports::{Acceptor, ConnectionType, Connector, TcpConnection};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha3::{Digest, Sha3_256};

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique sender instance id.
///
/// Hashes the caller's discriminator together with a process-local counter
/// and the current time, so two senders never share an id even when built
/// from the same endpoint in the same instant.
pub fn generate_instance_id(discriminator: &str) -> String {
    let counter = INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha3_256::new();
    hasher.update(discriminator.as_bytes());
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(counter.to_be_bytes());
    hasher.update(nanos.to_be_bytes());
    hex::encode(hasher.finalize())
}
