//! Communication Error Types
//!
//! Error taxonomy for the messaging substrate: transport failures on a single
//! connection, shutdown of a component, out-of-sequence delivery and
//! configuration problems.

use std::net::SocketAddr;
use thiserror::Error;

/// Main communication error type
#[derive(Error, Debug)]
pub enum CommunicationError {
    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// Connection establishment and per-connection failures
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Bad ConnectionType handshake from a connecting peer
    #[error("Handshake error: {message} (remote: {remote_addr:?})")]
    Handshake {
        message: String,
        remote_addr: Option<SocketAddr>,
    },

    /// Framing and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A peer's message arrived out of the expected order
    #[error("Out of sequence message from sender '{sender}' (received {received}, expected {expected})")]
    OutOfSequence {
        sender: String,
        expected: i64,
        received: i64,
    },

    /// The component has been shut down
    #[error("{component} shut down")]
    Shutdown { component: &'static str },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// An error raised on a background thread, rethrown to a later caller
    #[error("Queued error: {source}")]
    Queued { source: Box<CommunicationError> },

    /// Failed to start a worker thread
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },
}

/// Result type alias for communication operations
pub type Result<T> = std::result::Result<T, CommunicationError>;

impl CommunicationError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Handshake {
            message: message.into(),
            remote_addr,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a shutdown error for the named component
    pub fn shutdown(component: &'static str) -> Self {
        Self::Shutdown { component }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Wrap an error raised on a background thread
    pub fn queued(error: CommunicationError) -> Self {
        Self::Queued {
            source: Box::new(error),
        }
    }

    /// Check whether this error only reports a shutdown
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CommunicationError::Shutdown { .. })
    }

    /// Check if the failed operation may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CommunicationError::Io { .. } => true,
            CommunicationError::Connection { .. } => true,
            CommunicationError::Handshake { .. } => false,
            CommunicationError::Protocol { .. } => false,
            CommunicationError::OutOfSequence { .. } => true,
            CommunicationError::Shutdown { .. } => false,
            CommunicationError::Configuration { .. } => false,
            CommunicationError::Queued { source } => source.is_retryable(),
            CommunicationError::ThreadSpawn { .. } => true,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            CommunicationError::Io { .. } => "io",
            CommunicationError::Connection { .. } => "connection",
            CommunicationError::Handshake { .. } => "handshake",
            CommunicationError::Protocol { .. } => "protocol",
            CommunicationError::OutOfSequence { .. } => "out_of_sequence",
            CommunicationError::Shutdown { .. } => "shutdown",
            CommunicationError::Configuration { .. } => "configuration",
            CommunicationError::Queued { source } => source.category(),
            CommunicationError::ThreadSpawn { .. } => "thread_spawn",
        }
    }
}

/// Convert standard I/O errors to communication errors
impl From<std::io::Error> for CommunicationError {
    fn from(error: std::io::Error) -> Self {
        CommunicationError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert bincode errors to communication errors
impl From<bincode::Error> for CommunicationError {
    fn from(error: bincode::Error) -> Self {
        CommunicationError::protocol_with_source("Binary serialization failed", error)
    }
}

/// Convert TOML errors to communication errors
impl From<toml::de::Error> for CommunicationError {
    fn from(error: toml::de::Error) -> Self {
        CommunicationError::configuration(format!("TOML configuration error: {}", error), None)
    }
}
